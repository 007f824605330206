mod source_test;
mod store_test;

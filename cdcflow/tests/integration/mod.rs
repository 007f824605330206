mod checkpoint_test;
mod dead_letter_test;
mod delivery_test;
mod exactly_once_test;
mod reload_test;
mod store_failure_test;

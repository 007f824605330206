use crate::error::FlowResult;

/// Between a successful relay send and marking the outbox record delivered.
pub const OUTBOX_RELAY_AFTER_SEND: &str = "outbox_relay.after_send";
/// Between a successful at-least-once delivery and the workflow checkpoint write.
pub const DELIVERY_BEFORE_CHECKPOINT: &str = "delivery.before_checkpoint";

/// Returns an error when the named failpoint is configured to `return`.
///
/// The optional parameter selects the retry behavior of the error: `no_retry`,
/// `manual_retry` or `timed_retry`.
#[cfg(feature = "failpoints")]
pub fn flow_fail_point(name: &str) -> FlowResult<()> {
    use crate::bail;
    use crate::error::ErrorKind;

    fail::fail_point!(name, |parameter| {
        let error_kind = match parameter.as_deref() {
            Some("manual_retry") => ErrorKind::WithManualRetry,
            Some("timed_retry") => ErrorKind::WithTimedRetry,
            _ => ErrorKind::WithNoRetry,
        };

        bail!(
            error_kind,
            "An error occurred in a fail point",
            format!("The failpoint '{name}' returned an error")
        );
    });

    Ok(())
}

#[cfg(not(feature = "failpoints"))]
#[inline]
pub fn flow_fail_point(_name: &str) -> FlowResult<()> {
    Ok(())
}

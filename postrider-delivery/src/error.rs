use postrider_spool::SpoolError;
use thiserror::Error;

/// Failures of the delivery engine itself.
///
/// Downstream SMTP rejects are not errors here: they surface as
/// [`postrider_common::EnvelopeStatus`] values and are classified
/// permanent/temporary by reply code in the [`crate::scheduler`].
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Spool error: {0}")]
    Spool(#[from] SpoolError),

    #[error("Delivery processor not initialized: {0}")]
    NotInitialized(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spool_errors_convert_and_display() {
        let err: DeliveryError = SpoolError::Closed.into();
        assert_eq!(err.to_string(), "Spool error: Spool is shutting down");
    }
}

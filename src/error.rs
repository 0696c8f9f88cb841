use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bear launch failed for {target}: {reason}")]
    TransportFailure { target: String, reason: String },
    #[error("ledger storage unwritable: {0}")]
    LedgerUnwritable(String),
    #[error("callback receiver unreachable at {0}")]
    ReceiverUnavailable(String),
    #[error("export file invalid or unreadable: {0}")]
    InvalidExport(String),
}

/// Stable codes attached to structured warnings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarnCode {
    TransportFailure,
    CallbackData,
    LedgerCorrupt,
    IdentifierMismatch,
    ExportItemSkipped,
}

impl WarnCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransportFailure => "TRANSPORT_FAILURE",
            Self::CallbackData => "CALLBACK_DATA",
            Self::LedgerCorrupt => "LEDGER_CORRUPT",
            Self::IdentifierMismatch => "IDENTIFIER_MISMATCH",
            Self::ExportItemSkipped => "EXPORT_ITEM_SKIPPED",
        }
    }
}

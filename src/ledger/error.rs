use ulid::Ulid;

#[derive(Debug)]
pub enum LedgerError {
    NotFound(Ulid),
    AlreadyExists(String),
    /// The slot is held by this live reservation.
    Conflict(Ulid),
    Forbidden(Ulid),
    /// The reservation's slot has already started.
    PastBooking(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
    Timeout(&'static str),
    Internal(String),
}

impl LedgerError {
    /// Connectivity-class failures: the only ones worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::WalError(_) | LedgerError::Timeout(_))
    }
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::NotFound(id) => write!(f, "not found: {id}"),
            LedgerError::AlreadyExists(what) => write!(f, "already exists: {what}"),
            LedgerError::Conflict(id) => write!(f, "slot held by reservation {id}"),
            LedgerError::Forbidden(id) => write!(f, "not allowed to modify reservation {id}"),
            LedgerError::PastBooking(id) => write!(f, "reservation {id} has already started"),
            LedgerError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            LedgerError::WalError(e) => write!(f, "WAL error: {e}"),
            LedgerError::Timeout(op) => write!(f, "store call timed out: {op}"),
            LedgerError::Internal(e) => write!(f, "internal ledger error: {e}"),
        }
    }
}

impl std::error::Error for LedgerError {}

use crate::model::ItemId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Item not found: {0}")]
    NotFound(ItemId),
    #[error("Item already exists: {0}")]
    DuplicateItem(ItemId),
    #[error("Invalid parent for {item}: {reason}")]
    InvalidParent { item: ItemId, reason: String },
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("Invalid session state: {0}")]
    InvalidSessionState(String),
    #[error("A transaction is already open on this document")]
    NestedTransaction,
    #[error("CRDT error: {0}")]
    Crdt(String),
    #[error("Transaction aborted: {0}")]
    Aborted(String),
}

impl From<yrs::encoding::read::Error> for DocumentError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        DocumentError::Crdt(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DocumentError>;

//! Domain models for accounts, sync state, and sale records

mod account;
mod candidate;
mod cursor;
mod message;
mod sale;
mod sync_state;

pub use account::{Account, OAuthToken};
pub use candidate::{CandidateEvent, CandidateKind};
pub use cursor::HistoryCursor;
pub use message::{EmailAddress, MailMessage, MessageId};
pub use sale::{Carrier, SaleRecord, SaleStatus};
pub use sync_state::SyncState;

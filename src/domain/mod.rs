mod entry;
mod ledger;
mod withdrawal;

pub use entry::*;
pub use ledger::*;
pub use withdrawal::*;

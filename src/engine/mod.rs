pub mod cancel;

pub use cancel::{ensure_active, wait_or_cancel, CancelRegistry};

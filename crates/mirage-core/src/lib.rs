pub mod clock;
pub mod errors;
pub mod history;
pub mod ids;
pub mod provider;

pub use clock::{Clock, IdGenerator, ManualClock, SequentialIds, SystemClock, UuidIds};
pub use errors::{ImageGenError, ProviderError};

//! Event Sourcing Model
//!
//! - **`event`**: the `Event` record, its closed payload enum and `Path`.
//! - **`aggregate`**: the `Aggregate` trait, shared revision/identity checks and `fold`.
//! - **`note`** / **`folder`**: the two aggregate types.

pub mod aggregate;
pub mod event;
pub mod folder;
pub mod note;

pub use aggregate::*;
pub use event::*;
pub use folder::*;
pub use note::*;

pub mod event;
pub mod keys;
pub mod run;

pub use event::*;
pub use keys::*;
pub use run::*;

//! Turns an engine's trace stream into the closed event set and drives one
//! execution per job.

pub mod ancestry;
pub mod decode;
pub mod mock;
pub mod remote;
pub mod runner;
pub mod sources;
pub mod translate;
pub mod truncate;

pub use ancestry::Ancestry;
pub use mock::{ScriptedEngine, ScriptedStep};
pub use remote::HttpEngine;
pub use runner::JobRunner;
pub use translate::{Translated, Translator, TranslatorConfig};

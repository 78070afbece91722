//! Pipeline stages and orchestration for Loreforge.
//!
//! The seeds, crawler, and normalizer crates produce candidates; this crate
//! scores them ([`evaluator`]), writes them into the canonical store
//! ([`merge`]), records what each run did ([`reporter`]), and wires all
//! stages into one end-to-end run ([`pipeline`]).

pub mod evaluator;
pub mod merge;
pub mod pipeline;
pub mod reporter;
pub mod similarity;

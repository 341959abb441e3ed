#![warn(clippy::pedantic)]
#![allow(
    clippy::cast_lossless,
    clippy::cast_possible_truncation,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::many_single_char_names,
    clippy::module_name_repetitions,
    clippy::too_many_lines,
    clippy::similar_names,
    clippy::doc_markdown
)]
//! Staging simulator for rocket vessels: resource flow between parts,
//! engine burns and per-stage delta-v.
pub mod arena;
pub mod curve;
pub mod engine;
pub mod manager;
pub mod part;
pub mod resources;
pub mod simulation;
pub mod stage;
pub mod vessel;

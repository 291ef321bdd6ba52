//! Pipeline stages for document field extraction.
//!
//! Each submodule implements one transformation step.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ normalize ──▶ layout ──▶ recognize ──▶ fields ──▶ aggregate
//! (bytes)   (RGB8 page)   (hints)    (chain)       (parse)    (result)
//!              ▲                        │
//!            render                  enhance + encode
//!            (PDF)                   (per backend)
//! ```
//!
//! 1. [`input`]:     classify the source bytes as PDF or raster image
//! 2. [`normalize`]: decode (via [`render`] for PDFs) into one RGB8 page
//!    with a dimension cap; blocking, runs in `spawn_blocking`
//! 3. [`layout`]:    title block and dimension-area hints for drawings
//! 4. [`recognize`]: ordered backend chain (vision, then OCR); each backend
//!    gets its own [`enhance`] profile
//! 5. [`fields`]:    JSON parsing with repair, then pattern recovery
//! 6. [`aggregate`]: confidence, missing fields, success flag

pub mod aggregate;
pub mod encode;
pub mod enhance;
pub mod fields;
pub mod input;
pub mod layout;
pub mod normalize;
pub mod recognize;
pub mod render;

//! Built-in endpoint renderers: health probes and the 404 page.

pub mod health;
pub mod not_found;

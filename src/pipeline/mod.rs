//! Pipeline stages from candidate image to description.
//!
//! Each submodule implements one step, so each can be tested on its own and
//! swapped (a host with a real privileged context brings its own proxy).
//!
//! ## Data Flow
//!
//! ```text
//!            ┌─ render ─┐
//! candidate ─┼─ fetch  ─┼─▶ encode ──▶ client ──▶ description
//!            └─ proxy  ─┘  (data URL)  (POST + retry)
//! ```
//!
//! 1. [`convert`]: the ordered fallback chain over the three strategies
//! 2. [`render`]: re-encode an already-decoded raster (`spawn_blocking`)
//! 3. [`fetch`]: direct HTTP GET of the locator
//! 4. [`proxy`]: message-passing request to the privileged collaborator
//! 5. [`encode`]: the shared base64 / data-URL payload form
//! 6. [`client`]: multipart POST with timeout, response validation and
//!    the caller-side retry loop

pub mod client;
pub mod convert;
pub mod encode;
pub mod fetch;
pub mod proxy;
pub mod render;

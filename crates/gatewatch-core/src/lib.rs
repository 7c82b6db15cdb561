//! gatewatch-core — Identity resolution for the watch pipeline.
//!
//! Nearest-neighbour matching against a gallery of known faces, online
//! clustering of unmatched faces into stable unknown identities, and
//! per-identity alert throttling. No I/O beyond loading the gallery.

pub mod cluster;
pub mod gallery;
pub mod matcher;
pub mod throttle;
pub mod types;

pub use cluster::{Assignment, ClusterId, RepresentativePolicy, UnknownClusterer};
pub use gallery::{Gallery, GalleryError};
pub use matcher::{Matcher, NearestMatcher};
pub use throttle::{AlertThrottle, MIN_COOLDOWN_MS};
pub use types::{BoundingBox, Detection, Embedding, KnownIdentity, MatchResult, Metric};

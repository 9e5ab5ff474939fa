//! Tracker variants (C5, C6) and the Stream Downloader Facade (C7): the
//! parts specific to this platform adapter and to turning a `StreamOnline`
//! event into an on-disk capture.

pub mod backoff;
pub mod facade;
pub mod polling;
pub mod suppression;
pub mod webhook;

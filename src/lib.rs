//! ## z/OS container formats
//!
//! This crate decodes the three interlocking container formats produced by
//! the legacy z/OS data-interchange utilities and rebuilds the datasets,
//! members, messages and metadata they carry:
//!
//! - **NETDATA / XMI**, the wrapper written by the `TRANSMIT` family,
//!   carrying at most one dataset plus an optional message;
//! - **AWSTAPE / HET**, virtual tape images holding one or more labeled
//!   datasets, with optional per-block BZIP2/ZLIB compression in HET;
//! - the **IEBCOPY unload stream** found inside either of the above whenever
//!   the enclosed dataset is partitioned.
//!
//! Decoding is a pure, single-threaded function from input bytes to an
//! [`Archive`](archive::Archive); see [`archive::Archive::open_file`].

pub mod archive;
pub mod config;
pub mod cursor;
pub mod dates;
pub mod dump;
pub mod ebcdic;
pub mod error;
pub mod iebcopy;
pub mod recfm;
pub mod tape;
pub mod text;
pub mod text_unit;
pub mod xmi;

pub use archive::{Archive, ContainerKind, Dataset, DsOrg};
pub use config::Config;
pub use error::XmitError;
pub use iebcopy::{IspfStats, Member};

use smallstr::SmallString;

/// Names on z/OS are at most 8 EBCDIC characters, so they fit inline.
pub type FlexString = SmallString<[u8; 8]>;

pub type Result<T> = std::result::Result<T, XmitError>;

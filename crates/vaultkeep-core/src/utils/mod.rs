//! Utility functions for formatting and private file handling.

pub mod format;
pub mod fs;

pub use format::{format_hours, truncate_string};
pub use fs::{create_private_dir, write_private};

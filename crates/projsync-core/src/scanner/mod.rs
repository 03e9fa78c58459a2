mod walk;

pub use walk::{relative_key, scan_tree, FileStamp, ScannedFile};

pub mod differ;
pub mod extract;
pub mod hasher;

pub use differ::{diff_tree, list_deletes, DiffRequest};
pub use extract::{extract, ExtractAction};
pub use hasher::{hash_tree, stage_updater};

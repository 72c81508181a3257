pub mod format;
pub mod reader;
pub mod remote;
pub mod writer;

pub use format::{Footer, IndexEntry, PayloadEntry, Segment};
pub use reader::{ParsedPackage, PayloadReader, SelfPackage};
pub use remote::RemotePackage;
pub use writer::{pack, PackInputs, PackSummary};

//! General-purpose workspace tools.

mod echo;
mod list_files;
mod read_file;
mod write_file;

pub use echo::EchoTool;
pub use list_files::ListFilesTool;
pub use read_file::ReadFileTool;
pub use write_file::WriteFileTool;

//! Filesystem tools.

use std::sync::Arc;

use super::PathMessage;
use crate::args::{EmptyArgs, FsDeleteArgs, FsListDirectoryArgs, FsReadFileArgs, FsWriteArgs};
use crate::error::RegistryError;
use crate::handler::{FileSystem, Handlers, Removed};
use crate::registry::ToolRegistry;

pub const DIRECTORY_CREATED: &str = "Directory created successfully";
pub const FILE_WRITTEN: &str = "File created/updated successfully";
pub const DIRECTORY_DELETED: &str = "Directory deleted successfully";
pub const FILE_DELETED: &str = "File deleted successfully";

/// Shared body of `fsWriteFile` and the HTTP write route.
pub async fn write(fs: &dyn FileSystem, args: &FsWriteArgs) -> crate::error::Result<PathMessage> {
    if args.is_directory {
        let path = fs.create_directory(&args.path, args.mode()).await?;
        Ok(PathMessage::new(path.to_string_lossy(), DIRECTORY_CREATED))
    } else {
        let path = fs.write_file(&args.path, args.content.as_bytes(), args.mode()).await?;
        Ok(PathMessage::new(path.to_string_lossy(), FILE_WRITTEN))
    }
}

pub async fn delete(fs: &dyn FileSystem, args: &FsDeleteArgs) -> crate::error::Result<PathMessage> {
    let message = match fs.delete(&args.path, args.recursive).await? {
        Removed::Directory => DIRECTORY_DELETED,
        Removed::File => FILE_DELETED,
    };
    Ok(PathMessage::new(args.path.clone(), message))
}

pub fn register_tools(reg: &mut ToolRegistry, handlers: &Handlers) -> Result<(), RegistryError> {
    let fs = Arc::clone(&handlers.filesystem);
    reg.register_tool(
        "fsGetWorkingDirectory",
        "Get the current working directory",
        move |_: EmptyArgs| {
            let fs = Arc::clone(&fs);
            async move { Ok(fs.working_directory().to_string_lossy().into_owned()) }
        },
    )?;

    let fs = Arc::clone(&handlers.filesystem);
    reg.register_tool(
        "fsListDirectory",
        "List the entries of a directory",
        move |args: FsListDirectoryArgs| {
            let fs = Arc::clone(&fs);
            async move { fs.list_directory(&args.path).await }
        },
    )?;

    let fs = Arc::clone(&handlers.filesystem);
    reg.register_tool(
        "fsReadFile",
        "Read the contents of a file",
        move |args: FsReadFileArgs| {
            let fs = Arc::clone(&fs);
            async move { fs.read_file(&args.path).await }
        },
    )?;

    let fs = Arc::clone(&handlers.filesystem);
    reg.register_tool(
        "fsWriteFile",
        "Create or update a file, or create a directory",
        move |args: FsWriteArgs| {
            let fs = Arc::clone(&fs);
            async move { write(fs.as_ref(), &args).await }
        },
    )?;

    let fs = Arc::clone(&handlers.filesystem);
    reg.register_tool(
        "fsDeleteFileOrDirectory",
        "Delete a file or directory",
        move |args: FsDeleteArgs| {
            let fs = Arc::clone(&fs);
            async move { delete(fs.as_ref(), &args).await }
        },
    )?;

    Ok(())
}

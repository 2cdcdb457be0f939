//! crashtrace SDK - host-side ABI for the script VM diagnostics layer
//!
//! This crate holds the types a VM host and the diagnostics engine agree on,
//! without depending on the engine itself:
//!
//! - cell types, VM handles and register snapshots (`types`)
//! - the VM's runtime error table (`error`)
//! - the three replaceable extension points and the `ScriptVm` trait (`vm`)
//! - little-endian binary reader/writer (`codec`)
//! - the AMX module image and its embedded debug block (`image`, `debug_block`)
//!
//! # Example
//!
//! ```ignore
//! use crashtrace_sdk::{AmxImage, DebugBlock};
//!
//! let bytes = std::fs::read("gamemodes/test.amx")?;
//! let image = AmxImage::parse(&bytes)?;
//! if let Some(block) = image.debug_block() {
//!     let debug = DebugBlock::parse(block)?;
//!     println!("{} functions", debug.functions().count());
//! }
//! ```

#![warn(missing_docs)]

pub mod codec;
pub mod debug_block;
pub mod error;
pub mod image;
pub mod types;
pub mod vm;

pub use codec::{ByteReader, ByteWriter, DecodeError};
pub use debug_block::{
    DebugBlock, DebugBlockWriter, DebugFile, DebugLine, DebugSymbol, DebugTag, SymbolKind,
};
pub use error::{AmxError, AmxResult};
pub use image::{AmxHeader, AmxImage, AmxImageWriter};
pub use types::{
    Cell, NativeEntry, PublicEntry, Registers, UCell, VmHandle, CELL_SIZE, EXEC_CONT, EXEC_GDK,
    EXEC_MAIN,
};
pub use vm::{DebugHook, ExecEntry, ExtensionPoints, NativeDispatcher, ScriptVm};

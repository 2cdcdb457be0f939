//! The VM's runtime error table

/// Result type for VM calls
pub type AmxResult<T> = Result<T, AmxError>;

/// Runtime error codes defined by the VM.
///
/// The numeric values are the VM's own and are stable; `code()` and
/// `from_code()` convert at the host boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum AmxError {
    /// Forced exit
    #[error("Forced exit")]
    Exit,
    /// Assertion failed
    #[error("Assertion failed")]
    Assert,
    /// Stack/heap collision
    #[error("Stack/heap collision (insufficient stack size)")]
    StackErr,
    /// Array index out of bounds
    #[error("Array index out of bounds")]
    Bounds,
    /// Invalid memory access
    #[error("Invalid memory access")]
    MemAccess,
    /// Invalid instruction
    #[error("Invalid instruction")]
    InvInstr,
    /// Stack underflow
    #[error("Stack underflow")]
    StackLow,
    /// Heap underflow
    #[error("Heap underflow")]
    HeapLow,
    /// No (valid) native function callback
    #[error("No (valid) native function callback")]
    Callback,
    /// Native function failed
    #[error("Native function failed")]
    Native,
    /// Divide by zero
    #[error("Divide by zero")]
    Divide,
    /// Sleep mode
    #[error("(sleep mode)")]
    Sleep,
    /// Invalid state for this access
    #[error("Invalid state")]
    InvState,
    /// Out of memory
    #[error("Out of memory")]
    Memory,
    /// Invalid file format
    #[error("Invalid/unsupported P-code file format")]
    Format,
    /// File is for a newer version of the VM
    #[error("File is for a newer version of the AMX")]
    Version,
    /// File or function not found
    #[error("File or function is not found")]
    NotFound,
    /// Invalid index parameter (bad entry point)
    #[error("Invalid index parameter (bad entry point)")]
    Index,
    /// Debugger cannot run
    #[error("Debugger cannot run")]
    Debug,
    /// VM not initialized (or doubly initialized)
    #[error("AMX not initialized (or doubly initialized)")]
    Init,
    /// Unable to set user data field
    #[error("Unable to set user data field (table full)")]
    UserData,
    /// Cannot initialize the JIT
    #[error("Cannot initialize the JIT")]
    InitJit,
    /// Parameter error
    #[error("Parameter error")]
    Params,
    /// Domain error
    #[error("Domain error, expression result does not fit in range")]
    Domain,
    /// General error
    #[error("General error (unknown or unspecific error)")]
    General,
}

impl AmxError {
    /// Numeric error code as defined by the VM
    pub fn code(self) -> i32 {
        match self {
            AmxError::Exit => 1,
            AmxError::Assert => 2,
            AmxError::StackErr => 3,
            AmxError::Bounds => 4,
            AmxError::MemAccess => 5,
            AmxError::InvInstr => 6,
            AmxError::StackLow => 7,
            AmxError::HeapLow => 8,
            AmxError::Callback => 9,
            AmxError::Native => 10,
            AmxError::Divide => 11,
            AmxError::Sleep => 12,
            AmxError::InvState => 13,
            AmxError::Memory => 16,
            AmxError::Format => 17,
            AmxError::Version => 18,
            AmxError::NotFound => 19,
            AmxError::Index => 20,
            AmxError::Debug => 21,
            AmxError::Init => 22,
            AmxError::UserData => 23,
            AmxError::InitJit => 24,
            AmxError::Params => 25,
            AmxError::Domain => 26,
            AmxError::General => 27,
        }
    }

    /// Convert a host return code. `0` (no error) and unknown codes give `None`.
    pub fn from_code(code: i32) -> Option<Self> {
        let error = match code {
            1 => AmxError::Exit,
            2 => AmxError::Assert,
            3 => AmxError::StackErr,
            4 => AmxError::Bounds,
            5 => AmxError::MemAccess,
            6 => AmxError::InvInstr,
            7 => AmxError::StackLow,
            8 => AmxError::HeapLow,
            9 => AmxError::Callback,
            10 => AmxError::Native,
            11 => AmxError::Divide,
            12 => AmxError::Sleep,
            13 => AmxError::InvState,
            16 => AmxError::Memory,
            17 => AmxError::Format,
            18 => AmxError::Version,
            19 => AmxError::NotFound,
            20 => AmxError::Index,
            21 => AmxError::Debug,
            22 => AmxError::Init,
            23 => AmxError::UserData,
            24 => AmxError::InitJit,
            25 => AmxError::Params,
            26 => AmxError::Domain,
            27 => AmxError::General,
            _ => return None,
        };
        Some(error)
    }

    /// Convert a host return code into a result
    pub fn check(code: i32) -> AmxResult<()> {
        match code {
            0 => Ok(()),
            other => Err(AmxError::from_code(other).unwrap_or(AmxError::General)),
        }
    }
}

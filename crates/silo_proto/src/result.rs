//! Single-byte result codes carried in reply headers.

/// Protocol result codes. The numeric values are wire-visible and fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    Ok = 0,
    Unknown = 1,
    NotFound = 2,
    Generation = 3,
    Parameter = 4,
    Timeout = 9,
    RecordTooBig = 13,
    KeyBusy = 14,
    UnsupportedFeature = 16,
    DeviceOverload = 18,
    KeyMismatch = 19,
    Namespace = 20,
    BinName = 21,
    Forbidden = 22,
    UdfExecution = 100,
    BatchDisabled = 150,
    BatchMaxRequests = 151,
    BatchQueuesFull = 152,
}

impl ResultCode {
    pub fn is_ok(self) -> bool {
        self == ResultCode::Ok
    }

    /// Map a wire byte back to a known code; unrecognized bytes collapse to
    /// `Unknown`.
    pub fn from_wire(raw: u8) -> ResultCode {
        match raw {
            0 => ResultCode::Ok,
            1 => ResultCode::Unknown,
            2 => ResultCode::NotFound,
            3 => ResultCode::Generation,
            4 => ResultCode::Parameter,
            9 => ResultCode::Timeout,
            13 => ResultCode::RecordTooBig,
            14 => ResultCode::KeyBusy,
            16 => ResultCode::UnsupportedFeature,
            18 => ResultCode::DeviceOverload,
            19 => ResultCode::KeyMismatch,
            20 => ResultCode::Namespace,
            21 => ResultCode::BinName,
            22 => ResultCode::Forbidden,
            100 => ResultCode::UdfExecution,
            150 => ResultCode::BatchDisabled,
            151 => ResultCode::BatchMaxRequests,
            152 => ResultCode::BatchQueuesFull,
            _ => ResultCode::Unknown,
        }
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

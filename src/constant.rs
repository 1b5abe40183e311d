use crate::error::Error;

/// S7 protocol id, first byte of every PDU header.
pub(crate) const PROTOCOL_ID: u8 = 0x32;

// Remote operating service control, second byte of the PDU header
pub(crate) const ROSCTR_JOB: u8 = 0x01;
#[allow(dead_code)]
pub(crate) const ROSCTR_ACK: u8 = 0x02;
pub(crate) const ROSCTR_ACK_DATA: u8 = 0x03;
pub(crate) const ROSCTR_USER_DATA: u8 = 0x07;

// Parameter function codes
pub(crate) const FUNC_SETUP: u8 = 0xF0;
pub(crate) const FUNC_READ_VAR: u8 = 0x04;
pub(crate) const FUNC_WRITE_VAR: u8 = 0x05;
pub(crate) const FUNC_START_UPLOAD: u8 = 0x1D;
pub(crate) const FUNC_UPLOAD: u8 = 0x1E;
pub(crate) const FUNC_END_UPLOAD: u8 = 0x1F;

// Variable specification preamble of an S7-ANY request item
pub(crate) const SPEC_TYPE_VARIABLE: u8 = 0x12;
pub(crate) const SYNTAX_ID_ANY: u8 = 0x10;

// Area ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Area {
    /// System info of the 200 family
    SystemInfo = 0x03,
    /// System flags of the 200 family
    SystemFlags = 0x05,
    Counter = 0x1C,
    Timer = 0x1D,
    ProcessInput = 0x81,
    ProcessOutput = 0x82,
    /// Merkers are address registers within the CPU.
    /// The number of available flag bytes depends on the respective CPU and can be taken from the technical data.
    /// You can use flag bits, flag bytes, flag words or flag double words in a PLC program.
    Merker = 0x83,
    /// German thing, means building blocks
    /// This is your storage
    DataBausteine = 0x84,
    /// Instance data blocks, the storage of an FB call
    InstanceDataBausteine = 0x85,
    Local = 0x86,
    /// V memory of the 200 family
    V = 0x87,
}

impl Area {
    pub(crate) fn from_u8(value: u8) -> Result<Area, Error> {
        match value {
            0x03 => Ok(Area::SystemInfo),
            0x05 => Ok(Area::SystemFlags),
            0x1C => Ok(Area::Counter),
            0x1D => Ok(Area::Timer),
            0x81 => Ok(Area::ProcessInput),
            0x82 => Ok(Area::ProcessOutput),
            0x83 => Ok(Area::Merker),
            0x84 => Ok(Area::DataBausteine),
            0x85 => Ok(Area::InstanceDataBausteine),
            0x86 => Ok(Area::Local),
            0x87 => Ok(Area::V),
            _ => Err(Error::InvalidArgument {
                reason: format!("unknown area code 0x{:02X}", value),
            }),
        }
    }

    /// Only DB and IDB addresses carry a data-block number.
    pub(crate) fn has_db_number(self) -> bool {
        matches!(self, Area::DataBausteine | Area::InstanceDataBausteine)
    }

    /// Areas whose reads may be coalesced into a covering window.
    pub(crate) fn is_optimizable(self) -> bool {
        matches!(
            self,
            Area::DataBausteine | Area::ProcessInput | Area::ProcessOutput | Area::Merker
        )
    }

    pub(crate) fn text(self) -> &'static str {
        match self {
            Area::SystemInfo => "SI",
            Area::SystemFlags => "SF",
            Area::Counter => "C",
            Area::Timer => "T",
            Area::ProcessInput => "I",
            Area::ProcessOutput => "Q",
            Area::Merker => "M",
            Area::DataBausteine => "DB",
            Area::InstanceDataBausteine => "DI",
            Area::Local => "L",
            Area::V => "V",
        }
    }
}

// Word Length, the transport code of an S7-ANY request item
pub const WL_BIT: u8 = 0x01; //Bit (inside a word)
pub const WL_BYTE: u8 = 0x02; //Byte (8 bit)
pub const WL_CHAR: u8 = 0x03;
pub const WL_WORD: u8 = 0x04; //Word (16 bit)
pub const WL_INT: u8 = 0x05;
pub const WL_DWORD: u8 = 0x06; //Double Word (32 bit)
pub const WL_DINT: u8 = 0x07; //Double Int (32 bit -2147483648 to +2147483647)
pub const WL_REAL: u8 = 0x08; //Real (32 bit float)
pub const WL_OCTET: u8 = 0x09; //Octet string
pub const WL_COUNTER: u8 = 0x1C; //Counter (16 bit)
pub const WL_TIMER: u8 = 0x1D; //Timer (16 bit)

//dataSize to number of byte accordingly
pub(crate) fn data_size_byte(word_length: u8) -> usize {
    match word_length {
        WL_BIT | WL_BYTE | WL_CHAR | WL_OCTET => 1,
        WL_WORD | WL_INT | WL_COUNTER | WL_TIMER => 2,
        WL_DWORD | WL_DINT | WL_REAL => 4,
        _ => 0,
    }
}

// Result transport size, the transport code of a read/write data item
pub(crate) const TS_RES_NULL: u8 = 0;
pub(crate) const TS_RES_BIT: u8 = 3;
pub(crate) const TS_RES_BYTE: u8 = 4;
#[allow(dead_code)]
pub(crate) const TS_RES_INT: u8 = 5;
pub(crate) const TS_RES_REAL: u8 = 7;
pub(crate) const TS_RES_OCTET: u8 = 9;

/// Data items whose length field counts bytes; all others count bits.
pub(crate) fn result_transport_in_bytes(ts: u8) -> bool {
    ts == TS_RES_OCTET || ts == TS_RES_REAL || ts == TS_RES_BIT
}

// Return codes of read/write data items
pub(crate) const RC_DATA_OK: u8 = 0xFF;
pub(crate) const RC_NO_DATA: u8 = 0x0A;

//return code to a string description, used for per-item read/write failures
pub fn return_code_text(code: u8) -> &'static str {
    match code {
        0x00 => "CPU : Reserved",
        0x01 => "CPU : Hardware fault",
        0x03 => "CPU : Accessing the object not allowed",
        0x05 => "CPU : Invalid address",
        0x06 => "CPU : Data type not supported",
        0x07 => "CPU : Data type inconsistent",
        0x0A => "CPU : Object does not exist",
        0xFF => "OK",
        _ => "CPU : Unknown return code",
    }
}

// User data parameter layout
pub(crate) const UD_PARAMETER_HEAD: [u8; 3] = [0x00, 0x01, 0x12];
pub(crate) const UD_METHOD_REQUEST: u8 = 0x11;
pub(crate) const UD_METHOD_RESPONSE: u8 = 0x12;
pub(crate) const UD_TYPE_REQUEST: u8 = 0x04;
pub(crate) const UD_TYPE_RESPONSE: u8 = 0x08;
pub(crate) const UD_LAST_DATA_UNIT: u8 = 0x01;

/// Function group of a user-data exchange, the low nibble of the
/// type/group byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionGroup {
    Block = 0x3,
    Cpu = 0x4,
    Time = 0x7,
}

impl FunctionGroup {
    pub(crate) fn from_u8(value: u8) -> Result<FunctionGroup, Error> {
        match value {
            0x3 => Ok(FunctionGroup::Block),
            0x4 => Ok(FunctionGroup::Cpu),
            0x7 => Ok(FunctionGroup::Time),
            _ => Err(Error::UnexpectedResponse {
                reason: format!("unknown user-data function group 0x{:X}", value),
            }),
        }
    }
}

// User data subfunctions per group
pub(crate) const SUB_BLOCK_LIST: u8 = 0x01;
pub(crate) const SUB_BLOCK_LIST_OF_TYPE: u8 = 0x02;
pub(crate) const SUB_BLOCK_INFO: u8 = 0x03;
pub(crate) const SUB_CPU_READ_SZL: u8 = 0x01;
pub(crate) const SUB_TIME_READ_CLOCK: u8 = 0x01;
pub(crate) const SUB_TIME_SET_CLOCK: u8 = 0x02;

// System status list ids
pub(crate) const SZL_ID_AVAILABLE: u16 = 0x0000;
pub(crate) const SZL_ID_MODULE_IDENT: u16 = 0x0011;
pub(crate) const SZL_ID_COMPONENT_IDENT: u16 = 0x001C;
pub(crate) const SZL_ID_CPU_STATE: u16 = 0x0424;

// PLC Status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuState {
    Unknown = 0,
    StopByUser = 3,
    Stop = 4,
    Run = 8,
}

impl CpuState {
    pub(crate) fn from_u8(value: u8) -> Result<CpuState, Error> {
        match value {
            0 => Ok(CpuState::Unknown),
            3 => Ok(CpuState::StopByUser),
            4 => Ok(CpuState::Stop),
            8 => Ok(CpuState::Run),
            _ => Err(Error::UnexpectedResponse {
                reason: format!("invalid cpu state {}", value),
            }),
        }
    }
}

/// Block type in its ASCII-coded form, as used in block filenames
/// and in the list/info services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockType {
    Ob = 0x38,
    Db = 0x41,
    Sdb = 0x42,
    Fc = 0x43,
    Sfc = 0x44,
    Fb = 0x45,
    Sfb = 0x46,
}

impl BlockType {
    pub(crate) fn from_u8(value: u8) -> Result<Self, Error> {
        match value {
            0x38 => Ok(BlockType::Ob),
            0x41 => Ok(BlockType::Db),
            0x42 => Ok(BlockType::Sdb),
            0x43 => Ok(BlockType::Fc),
            0x44 => Ok(BlockType::Sfc),
            0x45 => Ok(BlockType::Fb),
            0x46 => Ok(BlockType::Sfb),
            _ => Err(Error::UnexpectedResponse {
                reason: format!("invalid block type 0x{:02X}", value),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubBlockType {
    Ob = 0x08,
    Db = 0x0A,
    Sdb = 0x0B,
    Fc = 0x0C,
    Sfc = 0x0D,
    Fb = 0x0E,
    Sfb = 0x0F,
}

impl SubBlockType {
    pub(crate) fn from_u8(value: u8) -> Result<Self, Error> {
        match value {
            0x08 => Ok(SubBlockType::Ob),
            0x0A => Ok(SubBlockType::Db),
            0x0B => Ok(SubBlockType::Sdb),
            0x0C => Ok(SubBlockType::Fc),
            0x0D => Ok(SubBlockType::Sfc),
            0x0E => Ok(SubBlockType::Fb),
            0x0F => Ok(SubBlockType::Sfb),
            _ => Err(Error::UnexpectedResponse {
                reason: format!("invalid sub block type 0x{:02X}", value),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockLang {
    Awl = 0x01,
    Kop = 0x02,
    Fup = 0x03,
    Scl = 0x04,
    Db = 0x05,
    Graph = 0x06,
}

impl BlockLang {
    pub(crate) fn from_u8(value: u8) -> Result<Self, Error> {
        match value {
            0x01 => Ok(BlockLang::Awl),
            0x02 => Ok(BlockLang::Kop),
            0x03 => Ok(BlockLang::Fup),
            0x04 => Ok(BlockLang::Scl),
            0x05 => Ok(BlockLang::Db),
            0x06 => Ok(BlockLang::Graph),
            _ => Err(Error::UnexpectedResponse {
                reason: format!("invalid block language 0x{:02X}", value),
            }),
        }
    }
}

// Fixed frame overheads shared by the planner, the sliced area accessors
// and the codec. A ReadVar reply spends 12 header + 2 parameter bytes
// before its first data item; each request item costs 12 bytes and each
// result item 4 bytes besides its payload.
pub(crate) const READ_OVERHEAD: usize = 18;
pub(crate) const WRITE_OVERHEAD: usize = 28;
pub(crate) const REQ_HEADER_SIZE: usize = 12;
pub(crate) const REQ_PART_SIZE: usize = 12;
pub(crate) const RES_HEADER_SIZE: usize = 14;
pub(crate) const RES_PART_OVERHEAD: usize = 4;
pub(crate) const WRITE_REQ_OVERHEAD: usize = 12;
pub(crate) const WRITE_ITEM_OVERHEAD: usize = 16;

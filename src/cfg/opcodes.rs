//! Closed opcode table for the EVM instruction set handled by the analysis.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Opcode {
    Stop,
    Add,
    Mul,
    Sub,
    Div,
    SDiv,
    Mod,
    SMod,
    AddMod,
    MulMod,
    Exp,
    SignExtend,
    Lt,
    Gt,
    SLt,
    SGt,
    Eq,
    IsZero,
    And,
    Or,
    Xor,
    Not,
    Byte,
    Shl,
    Shr,
    Sar,
    Sha3,
    Address,
    Balance,
    Origin,
    Caller,
    CallValue,
    CallDataLoad,
    CallDataSize,
    CallDataCopy,
    CodeSize,
    CodeCopy,
    GasPrice,
    ExtCodeSize,
    ExtCodeCopy,
    ReturnDataSize,
    ReturnDataCopy,
    ExtCodeHash,
    BlockHash,
    Coinbase,
    Timestamp,
    Number,
    PrevRandao,
    GasLimit,
    ChainId,
    SelfBalance,
    BaseFee,
    Pop,
    MLoad,
    MStore,
    MStore8,
    SLoad,
    SStore,
    Jump,
    JumpI,
    Pc,
    MSize,
    Gas,
    JumpDest,
    /// PUSH0..PUSH32; the payload is the immediate width in bytes.
    Push(u8),
    /// DUP1..DUP16
    Dup(u8),
    /// SWAP1..SWAP16
    Swap(u8),
    /// LOG0..LOG4
    Log(u8),
    Create,
    Call,
    CallCode,
    Return,
    DelegateCall,
    Create2,
    StaticCall,
    Revert,
    Invalid,
    SelfDestruct,
    /// Byte with no assigned instruction.
    Unknown(u8),
}

impl Opcode {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => Self::Stop,
            0x01 => Self::Add,
            0x02 => Self::Mul,
            0x03 => Self::Sub,
            0x04 => Self::Div,
            0x05 => Self::SDiv,
            0x06 => Self::Mod,
            0x07 => Self::SMod,
            0x08 => Self::AddMod,
            0x09 => Self::MulMod,
            0x0a => Self::Exp,
            0x0b => Self::SignExtend,
            0x10 => Self::Lt,
            0x11 => Self::Gt,
            0x12 => Self::SLt,
            0x13 => Self::SGt,
            0x14 => Self::Eq,
            0x15 => Self::IsZero,
            0x16 => Self::And,
            0x17 => Self::Or,
            0x18 => Self::Xor,
            0x19 => Self::Not,
            0x1a => Self::Byte,
            0x1b => Self::Shl,
            0x1c => Self::Shr,
            0x1d => Self::Sar,
            0x20 => Self::Sha3,
            0x30 => Self::Address,
            0x31 => Self::Balance,
            0x32 => Self::Origin,
            0x33 => Self::Caller,
            0x34 => Self::CallValue,
            0x35 => Self::CallDataLoad,
            0x36 => Self::CallDataSize,
            0x37 => Self::CallDataCopy,
            0x38 => Self::CodeSize,
            0x39 => Self::CodeCopy,
            0x3a => Self::GasPrice,
            0x3b => Self::ExtCodeSize,
            0x3c => Self::ExtCodeCopy,
            0x3d => Self::ReturnDataSize,
            0x3e => Self::ReturnDataCopy,
            0x3f => Self::ExtCodeHash,
            0x40 => Self::BlockHash,
            0x41 => Self::Coinbase,
            0x42 => Self::Timestamp,
            0x43 => Self::Number,
            0x44 => Self::PrevRandao,
            0x45 => Self::GasLimit,
            0x46 => Self::ChainId,
            0x47 => Self::SelfBalance,
            0x48 => Self::BaseFee,
            0x50 => Self::Pop,
            0x51 => Self::MLoad,
            0x52 => Self::MStore,
            0x53 => Self::MStore8,
            0x54 => Self::SLoad,
            0x55 => Self::SStore,
            0x56 => Self::Jump,
            0x57 => Self::JumpI,
            0x58 => Self::Pc,
            0x59 => Self::MSize,
            0x5a => Self::Gas,
            0x5b => Self::JumpDest,
            0x5f..=0x7f => Self::Push(byte - 0x5f),
            0x80..=0x8f => Self::Dup(byte - 0x7f),
            0x90..=0x9f => Self::Swap(byte - 0x8f),
            0xa0..=0xa4 => Self::Log(byte - 0xa0),
            0xf0 => Self::Create,
            0xf1 => Self::Call,
            0xf2 => Self::CallCode,
            0xf3 => Self::Return,
            0xf4 => Self::DelegateCall,
            0xf5 => Self::Create2,
            0xfa => Self::StaticCall,
            0xfd => Self::Revert,
            0xfe => Self::Invalid,
            0xff => Self::SelfDestruct,
            other => Self::Unknown(other),
        }
    }

    pub fn byte(self) -> u8 {
        match self {
            Self::Stop => 0x00,
            Self::Add => 0x01,
            Self::Mul => 0x02,
            Self::Sub => 0x03,
            Self::Div => 0x04,
            Self::SDiv => 0x05,
            Self::Mod => 0x06,
            Self::SMod => 0x07,
            Self::AddMod => 0x08,
            Self::MulMod => 0x09,
            Self::Exp => 0x0a,
            Self::SignExtend => 0x0b,
            Self::Lt => 0x10,
            Self::Gt => 0x11,
            Self::SLt => 0x12,
            Self::SGt => 0x13,
            Self::Eq => 0x14,
            Self::IsZero => 0x15,
            Self::And => 0x16,
            Self::Or => 0x17,
            Self::Xor => 0x18,
            Self::Not => 0x19,
            Self::Byte => 0x1a,
            Self::Shl => 0x1b,
            Self::Shr => 0x1c,
            Self::Sar => 0x1d,
            Self::Sha3 => 0x20,
            Self::Address => 0x30,
            Self::Balance => 0x31,
            Self::Origin => 0x32,
            Self::Caller => 0x33,
            Self::CallValue => 0x34,
            Self::CallDataLoad => 0x35,
            Self::CallDataSize => 0x36,
            Self::CallDataCopy => 0x37,
            Self::CodeSize => 0x38,
            Self::CodeCopy => 0x39,
            Self::GasPrice => 0x3a,
            Self::ExtCodeSize => 0x3b,
            Self::ExtCodeCopy => 0x3c,
            Self::ReturnDataSize => 0x3d,
            Self::ReturnDataCopy => 0x3e,
            Self::ExtCodeHash => 0x3f,
            Self::BlockHash => 0x40,
            Self::Coinbase => 0x41,
            Self::Timestamp => 0x42,
            Self::Number => 0x43,
            Self::PrevRandao => 0x44,
            Self::GasLimit => 0x45,
            Self::ChainId => 0x46,
            Self::SelfBalance => 0x47,
            Self::BaseFee => 0x48,
            Self::Pop => 0x50,
            Self::MLoad => 0x51,
            Self::MStore => 0x52,
            Self::MStore8 => 0x53,
            Self::SLoad => 0x54,
            Self::SStore => 0x55,
            Self::Jump => 0x56,
            Self::JumpI => 0x57,
            Self::Pc => 0x58,
            Self::MSize => 0x59,
            Self::Gas => 0x5a,
            Self::JumpDest => 0x5b,
            Self::Push(n) => 0x5f + n,
            Self::Dup(n) => 0x7f + n,
            Self::Swap(n) => 0x8f + n,
            Self::Log(n) => 0xa0 + n,
            Self::Create => 0xf0,
            Self::Call => 0xf1,
            Self::CallCode => 0xf2,
            Self::Return => 0xf3,
            Self::DelegateCall => 0xf4,
            Self::Create2 => 0xf5,
            Self::StaticCall => 0xfa,
            Self::Revert => 0xfd,
            Self::Invalid => 0xfe,
            Self::SelfDestruct => 0xff,
            Self::Unknown(b) => b,
        }
    }

    /// Width of the immediate argument following the opcode byte.
    pub fn immediate_len(self) -> usize {
        match self {
            Self::Push(n) => n as usize,
            _ => 0,
        }
    }

    /// (items popped, items pushed)
    pub fn stack_io(self) -> (usize, usize) {
        match self {
            Self::Stop | Self::JumpDest | Self::Invalid | Self::Unknown(_) => (0, 0),
            Self::Add
            | Self::Mul
            | Self::Sub
            | Self::Div
            | Self::SDiv
            | Self::Mod
            | Self::SMod
            | Self::Exp
            | Self::SignExtend
            | Self::Lt
            | Self::Gt
            | Self::SLt
            | Self::SGt
            | Self::Eq
            | Self::And
            | Self::Or
            | Self::Xor
            | Self::Byte
            | Self::Shl
            | Self::Shr
            | Self::Sar
            | Self::Sha3 => (2, 1),
            Self::AddMod | Self::MulMod => (3, 1),
            Self::IsZero
            | Self::Not
            | Self::Balance
            | Self::CallDataLoad
            | Self::ExtCodeSize
            | Self::ExtCodeHash
            | Self::BlockHash
            | Self::MLoad
            | Self::SLoad => (1, 1),
            Self::Address
            | Self::Origin
            | Self::Caller
            | Self::CallValue
            | Self::CallDataSize
            | Self::CodeSize
            | Self::GasPrice
            | Self::ReturnDataSize
            | Self::Coinbase
            | Self::Timestamp
            | Self::Number
            | Self::PrevRandao
            | Self::GasLimit
            | Self::ChainId
            | Self::SelfBalance
            | Self::BaseFee
            | Self::Pc
            | Self::MSize
            | Self::Gas
            | Self::Push(_) => (0, 1),
            Self::CallDataCopy | Self::CodeCopy | Self::ReturnDataCopy => (3, 0),
            Self::ExtCodeCopy => (4, 0),
            Self::Pop | Self::Jump | Self::SelfDestruct => (1, 0),
            Self::MStore | Self::MStore8 | Self::SStore | Self::JumpI | Self::Return | Self::Revert => {
                (2, 0)
            }
            Self::Dup(n) => (n as usize, n as usize + 1),
            Self::Swap(n) => (n as usize + 1, n as usize + 1),
            Self::Log(n) => (n as usize + 2, 0),
            Self::Create => (3, 1),
            Self::Create2 => (4, 1),
            Self::Call | Self::CallCode => (7, 1),
            Self::DelegateCall | Self::StaticCall => (6, 1),
        }
    }

    /// Opcodes that end execution of the current frame.
    pub fn is_halting(self) -> bool {
        matches!(
            self,
            Self::Stop | Self::Return | Self::Revert | Self::Invalid | Self::SelfDestruct
        )
    }

    /// Opcodes after which control never falls through to the next instruction.
    pub fn ends_block(self) -> bool {
        self.is_halting() || matches!(self, Self::Jump | Self::JumpI | Self::Unknown(_))
    }

    /// Values the model treats as opaque inputs produced outside the analysed program.
    pub fn is_external_data(self) -> bool {
        matches!(
            self,
            Self::Balance
                | Self::ExtCodeSize
                | Self::ExtCodeCopy
                | Self::ExtCodeHash
                | Self::ReturnDataSize
                | Self::ReturnDataCopy
        )
    }

    /// Sources whose value a transaction sender can influence.
    pub fn is_user_controlled(self) -> bool {
        matches!(
            self,
            Self::Origin
                | Self::Caller
                | Self::CallValue
                | Self::CallDataLoad
                | Self::CallDataSize
                | Self::CallDataCopy
                | Self::ExtCodeSize
                | Self::ExtCodeCopy
                | Self::MLoad
                | Self::SLoad
        )
    }

    pub fn reads_memory(self) -> bool {
        matches!(
            self,
            Self::MLoad
                | Self::Sha3
                | Self::Log(_)
                | Self::Return
                | Self::Revert
                | Self::Create
                | Self::Create2
                | Self::Call
                | Self::CallCode
                | Self::DelegateCall
                | Self::StaticCall
        )
    }

    pub fn writes_memory(self) -> bool {
        matches!(
            self,
            Self::MStore
                | Self::MStore8
                | Self::CallDataCopy
                | Self::CodeCopy
                | Self::ExtCodeCopy
                | Self::ReturnDataCopy
        )
    }

    pub fn is_push(self) -> bool {
        matches!(self, Self::Push(_))
    }

    pub fn name(self) -> String {
        match self {
            Self::Push(n) => format!("PUSH{n}"),
            Self::Dup(n) => format!("DUP{n}"),
            Self::Swap(n) => format!("SWAP{n}"),
            Self::Log(n) => format!("LOG{n}"),
            Self::Unknown(b) => format!("UNKNOWN_0x{b:02x}"),
            other => format!("{other:?}").to_ascii_uppercase(),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_round_trip_covers_every_value() {
        for b in 0..=u8::MAX {
            assert_eq!(Opcode::from_byte(b).byte(), b);
        }
    }

    #[test]
    fn test_families_decode_to_their_index() {
        assert_eq!(Opcode::from_byte(0x5f), Opcode::Push(0));
        assert_eq!(Opcode::from_byte(0x63), Opcode::Push(4));
        assert_eq!(Opcode::from_byte(0x80), Opcode::Dup(1));
        assert_eq!(Opcode::from_byte(0x9f), Opcode::Swap(16));
        assert_eq!(Opcode::from_byte(0xa4), Opcode::Log(4));
        assert_eq!(Opcode::Push(32).immediate_len(), 32);
    }

    #[test]
    fn test_names_match_mnemonics() {
        assert_eq!(Opcode::SStore.name(), "SSTORE");
        assert_eq!(Opcode::CallDataLoad.name(), "CALLDATALOAD");
        assert_eq!(Opcode::Push(2).name(), "PUSH2");
        assert_eq!(Opcode::Unknown(0x0c).name(), "UNKNOWN_0x0c");
    }

    #[test]
    fn test_halting_set() {
        for op in [
            Opcode::Stop,
            Opcode::Return,
            Opcode::Revert,
            Opcode::Invalid,
            Opcode::SelfDestruct,
        ] {
            assert!(op.is_halting());
        }
        assert!(!Opcode::JumpI.is_halting());
        assert!(Opcode::JumpI.ends_block());
    }
}

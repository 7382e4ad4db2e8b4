//! Instruction set of the smx virtual machine
//!
//! Every instruction is one cell holding the opcode number followed by zero
//! or more operand cells. Opcode numbers are fixed by the image format and
//! must never be reordered.
//!
//! Opcodes fall into three groups:
//! - live opcodes emitted by current compilers,
//! - deprecated opcodes kept so that old images fail with a distinct error,
//! - recognised opcodes the interpreter deliberately leaves unimplemented.

use std::fmt;

/// Mask applied to an instruction cell to obtain the opcode number
pub const OPCODE_MASK: u32 = 0xFF;

/// Operand layout of an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operands {
    /// A fixed number of operand cells
    Fixed(u8),
    /// `casetbl`: count, default target, then `count` (value, target) pairs
    CaseTable,
    /// Legacy debug records with a self-described length
    Variable,
}

/// Lifecycle status of an opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpcodeStatus {
    /// Emitted by current compilers
    Live,
    /// Only produced by obsolete compilers
    Deprecated,
    /// Part of the instruction set but not supported by this interpreter
    Unsupported,
}

const O0: Operands = Operands::Fixed(0);
const O1: Operands = Operands::Fixed(1);
const O2: Operands = Operands::Fixed(2);
const O3: Operands = Operands::Fixed(3);
const O4: Operands = Operands::Fixed(4);
const O5: Operands = Operands::Fixed(5);
const VAR: Operands = Operands::Variable;
const CASES: Operands = Operands::CaseTable;

use OpcodeStatus::{Deprecated as Dep, Live, Unsupported as Uns};

macro_rules! opcodes {
    ($( $variant:ident = $value:literal, $name:literal, $ops:expr, $status:expr; )*) => {
        /// Bytecode opcode enumeration
        #[repr(u32)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[allow(missing_docs)]
        pub enum Opcode {
            $( $variant = $value, )*
        }

        impl Opcode {
            /// Decode an opcode number
            pub fn from_u32(value: u32) -> Option<Self> {
                match value {
                    $( $value => Some(Opcode::$variant), )*
                    _ => None,
                }
            }

            /// Assembler mnemonic
            pub fn name(self) -> &'static str {
                match self {
                    $( Opcode::$variant => $name, )*
                }
            }

            /// Operand layout
            pub fn operands(self) -> Operands {
                match self {
                    $( Opcode::$variant => $ops, )*
                }
            }

            /// Lifecycle status
            pub fn status(self) -> OpcodeStatus {
                match self {
                    $( Opcode::$variant => $status, )*
                }
            }

            /// Every opcode, in numeric order
            pub const ALL: &'static [Opcode] = &[ $( Opcode::$variant, )* ];
        }
    };
}

opcodes! {
    Invalid = 0, "none", O0, Dep;
    LoadPri = 1, "load.pri", O1, Live;
    LoadAlt = 2, "load.alt", O1, Live;
    LoadSPri = 3, "load.s.pri", O1, Live;
    LoadSAlt = 4, "load.s.alt", O1, Live;
    LrefPri = 5, "lref.pri", O1, Live;
    LrefAlt = 6, "lref.alt", O1, Live;
    LrefSPri = 7, "lref.s.pri", O1, Live;
    LrefSAlt = 8, "lref.s.alt", O1, Live;
    LoadI = 9, "load.i", O0, Live;
    LodbI = 10, "lodb.i", O1, Live;
    ConstPri = 11, "const.pri", O1, Live;
    ConstAlt = 12, "const.alt", O1, Live;
    AddrPri = 13, "addr.pri", O1, Live;
    AddrAlt = 14, "addr.alt", O1, Live;
    StorPri = 15, "stor.pri", O1, Live;
    StorAlt = 16, "stor.alt", O1, Live;
    StorSPri = 17, "stor.s.pri", O1, Live;
    StorSAlt = 18, "stor.s.alt", O1, Live;
    SrefPri = 19, "sref.pri", O1, Live;
    SrefAlt = 20, "sref.alt", O1, Live;
    SrefSPri = 21, "sref.s.pri", O1, Live;
    SrefSAlt = 22, "sref.s.alt", O1, Live;
    StorI = 23, "stor.i", O0, Live;
    StrbI = 24, "strb.i", O1, Live;
    Lidx = 25, "lidx", O0, Live;
    LidxB = 26, "lidx.b", O1, Live;
    Idxaddr = 27, "idxaddr", O0, Live;
    IdxaddrB = 28, "idxaddr.b", O1, Live;
    AlignPri = 29, "align.pri", O1, Live;
    AlignAlt = 30, "align.alt", O1, Live;
    Lctrl = 31, "lctrl", O1, Live;
    Sctrl = 32, "sctrl", O1, Live;
    MovePri = 33, "move.pri", O0, Live;
    MoveAlt = 34, "move.alt", O0, Live;
    Xchg = 35, "xchg", O0, Live;
    PushPri = 36, "push.pri", O0, Live;
    PushAlt = 37, "push.alt", O0, Live;
    PushR = 38, "push.r", O1, Dep;
    PushC = 39, "push.c", O1, Live;
    Push = 40, "push", O1, Live;
    PushS = 41, "push.s", O1, Live;
    PopPri = 42, "pop.pri", O0, Live;
    PopAlt = 43, "pop.alt", O0, Live;
    Stack = 44, "stack", O1, Live;
    Heap = 45, "heap", O1, Live;
    Proc = 46, "proc", O0, Live;
    Ret = 47, "ret", O0, Live;
    Retn = 48, "retn", O0, Live;
    Call = 49, "call", O1, Live;
    CallPri = 50, "call.pri", O0, Dep;
    Jump = 51, "jump", O1, Live;
    Jrel = 52, "jrel", O1, Dep;
    Jzer = 53, "jzer", O1, Live;
    Jnz = 54, "jnz", O1, Live;
    Jeq = 55, "jeq", O1, Live;
    Jneq = 56, "jneq", O1, Live;
    Jless = 57, "jless", O1, Uns;
    Jleq = 58, "jleq", O1, Uns;
    Jgrtr = 59, "jgrtr", O1, Uns;
    Jgeq = 60, "jgeq", O1, Uns;
    Jsless = 61, "jsless", O1, Live;
    Jsleq = 62, "jsleq", O1, Live;
    Jsgrtr = 63, "jsgrtr", O1, Live;
    Jsgeq = 64, "jsgeq", O1, Live;
    Shl = 65, "shl", O0, Live;
    Shr = 66, "shr", O0, Live;
    Sshr = 67, "sshr", O0, Live;
    ShlCPri = 68, "shl.c.pri", O1, Live;
    ShlCAlt = 69, "shl.c.alt", O1, Live;
    ShrCPri = 70, "shr.c.pri", O1, Live;
    ShrCAlt = 71, "shr.c.alt", O1, Live;
    Smul = 72, "smul", O0, Live;
    Sdiv = 73, "sdiv", O0, Live;
    SdivAlt = 74, "sdiv.alt", O0, Live;
    Umul = 75, "umul", O0, Uns;
    Udiv = 76, "udiv", O0, Uns;
    UdivAlt = 77, "udiv.alt", O0, Uns;
    Add = 78, "add", O0, Live;
    Sub = 79, "sub", O0, Live;
    SubAlt = 80, "sub.alt", O0, Live;
    And = 81, "and", O0, Live;
    Or = 82, "or", O0, Live;
    Xor = 83, "xor", O0, Live;
    Not = 84, "not", O0, Live;
    Neg = 85, "neg", O0, Live;
    Invert = 86, "invert", O0, Live;
    AddC = 87, "add.c", O1, Live;
    SmulC = 88, "smul.c", O1, Live;
    ZeroPri = 89, "zero.pri", O0, Live;
    ZeroAlt = 90, "zero.alt", O0, Live;
    Zero = 91, "zero", O1, Live;
    ZeroS = 92, "zero.s", O1, Live;
    SignPri = 93, "sign.pri", O0, Live;
    SignAlt = 94, "sign.alt", O0, Live;
    Eq = 95, "eq", O0, Live;
    Neq = 96, "neq", O0, Live;
    Less = 97, "less", O0, Uns;
    Leq = 98, "leq", O0, Uns;
    Grtr = 99, "grtr", O0, Uns;
    Geq = 100, "geq", O0, Uns;
    Sless = 101, "sless", O0, Live;
    Sleq = 102, "sleq", O0, Live;
    Sgrtr = 103, "sgrtr", O0, Live;
    Sgeq = 104, "sgeq", O0, Live;
    EqCPri = 105, "eq.c.pri", O1, Live;
    EqCAlt = 106, "eq.c.alt", O1, Live;
    IncPri = 107, "inc.pri", O0, Live;
    IncAlt = 108, "inc.alt", O0, Live;
    Inc = 109, "inc", O1, Live;
    IncS = 110, "inc.s", O1, Live;
    IncI = 111, "inc.i", O0, Live;
    DecPri = 112, "dec.pri", O0, Live;
    DecAlt = 113, "dec.alt", O0, Live;
    Dec = 114, "dec", O1, Live;
    DecS = 115, "dec.s", O1, Live;
    DecI = 116, "dec.i", O0, Live;
    Movs = 117, "movs", O1, Live;
    Cmps = 118, "cmps", O1, Live;
    Fill = 119, "fill", O1, Live;
    Halt = 120, "halt", O1, Live;
    Bounds = 121, "bounds", O1, Live;
    SysreqPri = 122, "sysreq.pri", O0, Dep;
    SysreqC = 123, "sysreq.c", O1, Live;
    File = 124, "file", VAR, Dep;
    Line = 125, "line", O2, Dep;
    Symbol = 126, "symbol", VAR, Dep;
    Srange = 127, "srange", O2, Dep;
    JumpPri = 128, "jump.pri", O0, Dep;
    Switch = 129, "switch", O1, Live;
    Casetbl = 130, "casetbl", CASES, Live;
    SwapPri = 131, "swap.pri", O0, Live;
    SwapAlt = 132, "swap.alt", O0, Live;
    PushAdr = 133, "push.adr", O1, Live;
    Nop = 134, "nop", O0, Live;
    SysreqN = 135, "sysreq.n", O2, Live;
    Symtag = 136, "symtag", O1, Dep;
    Break = 137, "break", O0, Live;
    Push2C = 138, "push2.c", O2, Live;
    Push2 = 139, "push2", O2, Live;
    Push2S = 140, "push2.s", O2, Live;
    Push2Adr = 141, "push2.adr", O2, Live;
    Push3C = 142, "push3.c", O3, Live;
    Push3 = 143, "push3", O3, Live;
    Push3S = 144, "push3.s", O3, Live;
    Push3Adr = 145, "push3.adr", O3, Live;
    Push4C = 146, "push4.c", O4, Live;
    Push4 = 147, "push4", O4, Live;
    Push4S = 148, "push4.s", O4, Live;
    Push4Adr = 149, "push4.adr", O4, Live;
    Push5C = 150, "push5.c", O5, Live;
    Push5 = 151, "push5", O5, Live;
    Push5S = 152, "push5.s", O5, Live;
    Push5Adr = 153, "push5.adr", O5, Live;
    LoadBoth = 154, "load.both", O2, Live;
    LoadSBoth = 155, "load.s.both", O2, Live;
    Const = 156, "const", O2, Live;
    ConstS = 157, "const.s", O2, Live;
    SysreqD = 158, "sysreq.d", O1, Dep;
    SysreqNd = 159, "sysreq.nd", O2, Dep;
    TrackerPushC = 160, "tracker.push.c", O1, Live;
    TrackerPopSetheap = 161, "tracker.pop.setheap", O0, Live;
    Genarray = 162, "genarray", O1, Live;
    GenarrayZ = 163, "genarray.z", O1, Live;
    StradjustPri = 164, "stradjust.pri", O0, Live;
    Stackadjust = 165, "stackadjust", O1, Uns;
    Endproc = 166, "endproc", O0, Live;
    LdgfnPri = 167, "ldgfn.pri", O1, Uns;
    Rebase = 168, "rebase", O3, Uns;
    InitarrayPri = 169, "initarray.pri", O5, Uns;
    InitarrayAlt = 170, "initarray.alt", O5, Uns;
    HeapSave = 171, "heap.save", O0, Live;
    HeapRestore = 172, "heap.restore", O0, Live;
    FirstFake = 173, "first.fake", O0, Dep;
    Fabs = 174, "fabs", O0, Live;
    Float = 175, "float", O0, Live;
    FloatAdd = 176, "float.add", O0, Live;
    FloatSub = 177, "float.sub", O0, Live;
    FloatMul = 178, "float.mul", O0, Live;
    FloatDiv = 179, "float.div", O0, Live;
    RndToNearest = 180, "round", O0, Live;
    RndToFloor = 181, "floor", O0, Live;
    RndToCeil = 182, "ceil", O0, Live;
    RndToZero = 183, "rndtozero", O0, Live;
    FloatCmp = 184, "float.cmp", O0, Live;
    FloatGt = 185, "float.gt", O0, Live;
    FloatGe = 186, "float.ge", O0, Live;
    FloatLt = 187, "float.lt", O0, Live;
    FloatLe = 188, "float.le", O0, Live;
    FloatNe = 189, "float.ne", O0, Live;
    FloatEq = 190, "float.eq", O0, Live;
    FloatNot = 191, "float.not", O0, Live;
}

impl Opcode {
    /// Decode the opcode stored in an instruction cell
    pub fn from_cell(cell: u32) -> Option<Self> {
        Self::from_u32(cell & OPCODE_MASK)
    }

    /// Convert to the raw opcode number
    #[inline]
    pub fn to_u32(self) -> u32 {
        self as u32
    }

    /// Opcode as an instruction cell
    #[inline]
    pub fn to_cell(self) -> i32 {
        self as i32
    }

    /// Whether the opcode only appears in obsolete images
    pub fn is_deprecated(self) -> bool {
        self.status() == OpcodeStatus::Deprecated
    }

    /// Whether the instruction transfers control through a code address operand
    pub fn is_jump(self) -> bool {
        matches!(
            self,
            Opcode::Jump
                | Opcode::Jzer
                | Opcode::Jnz
                | Opcode::Jeq
                | Opcode::Jneq
                | Opcode::Jsless
                | Opcode::Jsleq
                | Opcode::Jsgrtr
                | Opcode::Jsgeq
                | Opcode::Call
                | Opcode::Switch
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_numbers_are_dense() {
        for (index, opcode) in Opcode::ALL.iter().enumerate() {
            assert_eq!(opcode.to_u32(), index as u32, "{opcode} out of place");
            assert_eq!(Opcode::from_u32(index as u32), Some(*opcode));
        }
        assert_eq!(Opcode::from_u32(Opcode::ALL.len() as u32), None);
    }

    #[test]
    fn test_from_cell_masks_immediate() {
        assert_eq!(Opcode::from_cell(0x1234_0078), Some(Opcode::Halt));
    }

    #[test]
    fn test_names() {
        assert_eq!(Opcode::SysreqN.name(), "sysreq.n");
        assert_eq!(Opcode::Push3Adr.to_string(), "push3.adr");
    }

    #[test]
    fn test_status() {
        assert!(Opcode::Jrel.is_deprecated());
        assert_eq!(Opcode::Umul.status(), OpcodeStatus::Unsupported);
        assert_eq!(Opcode::Sdiv.status(), OpcodeStatus::Live);
        assert_eq!(Opcode::Casetbl.operands(), Operands::CaseTable);
    }
}

use strum::EnumIs;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash, EnumIs, Error)]
pub enum Error {
    /// A handle does not refer to any live element of the program unit.
    #[error("Cannot build a reference from a {kind} handle that does not refer to any live element.")]
    InvalidHandle { kind: &'static str },

    /// The instruction is not part of the ordered instruction stream.
    #[error("The instruction is not linked into the instruction stream of the body.")]
    UnlinkedInstruction,

    /// The instruction is already part of the ordered instruction stream.
    #[error("The instruction is already linked into the instruction stream and cannot be linked twice.")]
    AlreadyLinked,

    /// Removing an instruction would leave a jump target or region bound without a successor.
    #[error(
        "The instruction at position {at} is referenced by a jump or an exception region but has no successor to re-target to."
    )]
    DanglingTarget { at: usize },

    /// A jump at `at` refers to an instruction that is not linked.
    #[error("The jump at position {at} targets an instruction that is not linked into the stream.")]
    UnlinkedTarget { at: usize },

    /// An exception region is not well ordered.
    #[error(
        "Exception region #{index} is malformed: its bounds must be linked and ordered as try start < try end <= handler start < handler end."
    )]
    MalformedRegion { index: usize },

    /// A local slot index is out of range.
    #[error("Method `{method}` refers to the undeclared local V_{local}.")]
    UndeclaredLocal { method: String, local: u16 },

    /// A method was expected to have a body.
    #[error("Method `{method}` has no body.")]
    MissingBody { method: String },

    /// A body contains no instruction.
    #[error("Method `{method}` has an empty body.")]
    EmptyBody { method: String },

    /// Not enough values on the evaluation stack.
    #[error("Stack underflow in `{method}` at position {at}.")]
    StackUnderflow { method: String, at: usize },

    /// Two paths reach the same instruction with different stack depths.
    #[error(
        "Inconsistent stack depth in `{method}` at position {at}: reached with {expected} and {found} values."
    )]
    InconsistentStack {
        method: String,
        at: usize,
        expected: u16,
        found: u16,
    },

    /// A return does not leave exactly the return value on the stack.
    #[error("Return in `{method}` at position {at} is reached with {depth} values on the stack.")]
    StackImbalanceAtReturn {
        method: String,
        at: usize,
        depth: u16,
    },

    /// A `ret` instruction sits inside a try or handler region.
    #[error("Return in `{method}` at position {at} is inside a protected region; use leave instead.")]
    ReturnInProtectedRegion { method: String, at: usize },

    /// Control flows past the last instruction.
    #[error("Control falls off the end of `{method}` after position {at}.")]
    FallOffEnd { method: String, at: usize },

    /// A referenced type has no definition in the program unit.
    #[error("Type `{name}` has no definition in the program unit.")]
    UnresolvedType { name: String },

    /// Two type definitions share a full name.
    #[error("Type `{name}` is defined more than once in the program unit.")]
    DuplicateType { name: String },

    /// A called method has neither a body nor a registered native.
    #[error("Method `{method}` has no body and no native implementation was registered for it.")]
    NoImplementation { method: String },

    /// The interpreter met a value it cannot operate on.
    #[error("Interpreter fault in `{method}` at position {at}: {reason}")]
    InterpreterFault {
        method: String,
        at: usize,
        reason: String,
    },
}

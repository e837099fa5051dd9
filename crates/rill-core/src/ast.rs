//! Abstract Syntax Tree for RillQL execution plans
//!
//! The compiler front end produces one [`ExecutionPlan`] per compilation
//! unit. The plan is a pure tree: every node is exclusively owned by its
//! parent, and stream references are carried as string identifiers rather
//! than back-pointers.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Root of a compiled RillQL document.
///
/// Definition maps preserve declaration order; streams, tables and
/// functions live in separate namespaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExecutionPlan {
    /// Plan-level annotations: `@plan:name('Demo')`
    pub annotations: Vec<Annotation>,
    pub stream_definitions: IndexMap<String, StreamDefinition>,
    pub table_definitions: IndexMap<String, TableDefinition>,
    pub function_definitions: IndexMap<String, FunctionDefinition>,
    /// Queries and partitions, in source order
    pub execution_elements: Vec<ExecutionElement>,
}

/// Top-level executable element of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionElement {
    Query(Query),
    Partition(Partition),
}

/// Annotation: `@info(name = 'q1')` or `@plan:name('Demo')`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub name: String,
    pub elements: Vec<AnnotationElement>,
}

/// Key/value pair inside an annotation; the key is optional
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationElement {
    pub key: Option<String>,
    pub value: String,
}

/// Stream definition: `define stream StockStream (symbol string, price double)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDefinition {
    pub id: String,
    pub attributes: Vec<Attribute>,
    pub annotations: Vec<Annotation>,
}

/// Table definition: `define table HoldingsTable (symbol string, qty long)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDefinition {
    pub id: String,
    pub attributes: Vec<Attribute>,
    pub annotations: Vec<Annotation>,
}

/// Script function definition:
/// `define function concatFn[javascript] return string { ... }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub id: String,
    pub language: String,
    pub return_type: AttributeType,
    pub body: String,
}

/// A named, typed attribute of a stream or table definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub ty: AttributeType,
}

/// Attribute types carried by events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeType {
    String,
    Int,
    Long,
    Float,
    Double,
    Bool,
    Object,
}

impl AttributeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttributeType::String => "string",
            AttributeType::Int => "int",
            AttributeType::Long => "long",
            AttributeType::Float => "float",
            AttributeType::Double => "double",
            AttributeType::Bool => "bool",
            AttributeType::Object => "object",
        }
    }
}

/// A single query: input, projection, rate limiting and output target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub annotations: Vec<Annotation>,
    pub input: InputStream,
    pub selector: Selector,
    pub output_rate: Option<OutputRate>,
    pub output: OutputStream,
}

/// Input side of a query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InputStream {
    /// One source, optionally filtered/windowed: `from S[price > 10]#window.length(5)`
    Single(SingleInputStream),
    /// Two sources joined on a condition
    Join(Box<JoinInputStream>),
    /// Pattern or sequence state machine
    State(StateInputStream),
    /// A nested query whose output feeds the enclosing query
    Anonymous(Box<Query>),
}

/// A single named source with its handler chain.
///
/// Handlers before the window see raw events; handlers after it see the
/// windowed view. With no window, `post_window_handlers` stays empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleInputStream {
    pub stream_id: String,
    /// Inner streams (`#Name`) only exist inside partitions
    pub is_inner_stream: bool,
    /// Join alias or pattern event reference: `e1=StockStream`, `S as a`
    pub alias: Option<String>,
    pub pre_window_handlers: Vec<StreamHandler>,
    pub window: Option<FunctionCall>,
    pub post_window_handlers: Vec<StreamHandler>,
}

impl SingleInputStream {
    pub fn new(stream_id: impl Into<String>, is_inner_stream: bool) -> Self {
        SingleInputStream {
            stream_id: stream_id.into(),
            is_inner_stream,
            alias: None,
            pre_window_handlers: Vec::new(),
            window: None,
            post_window_handlers: Vec::new(),
        }
    }

    /// Name later references resolve against: the alias if one is set,
    /// the raw stream id otherwise.
    pub fn reference_id(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.stream_id)
    }
}

/// One stage of a stream handler chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamHandler {
    /// Filter: `[price > 100]`
    Filter(Expression),
    /// Stream function: `#log('msg')` or `#str:tokenize(sentence)`
    Function(FunctionCall),
}

/// Two-way join over single input streams
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinInputStream {
    pub left: SingleInputStream,
    pub join_type: JoinType,
    pub right: SingleInputStream,
    pub on: Option<Expression>,
    pub trigger: JoinTrigger,
    pub within: Option<TimeConstant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinType {
    Inner,
    LeftOuter,
    RightOuter,
    FullOuter,
}

/// Which side's events drive the join. A unidirectional side never
/// triggers; the opposite side does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinTrigger {
    Left,
    Right,
    All,
}

/// Pattern or sequence input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateInputStream {
    pub kind: StateKind,
    pub state: StateElement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateKind {
    /// Ordered, possibly non-contiguous occurrences (`->` chains)
    Pattern,
    /// Strictly ordered, contiguous occurrences (`,` chains)
    Sequence,
}

/// Node of a pattern/sequence state machine; any node may carry a
/// `within` time bound limiting the match duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateElement {
    pub kind: StateElementKind,
    pub within: Option<TimeConstant>,
}

impl StateElement {
    pub fn new(kind: StateElementKind) -> Self {
        StateElement { kind, within: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StateElementKind {
    /// Leaf: one event source, optionally aliased (`e1=StockStream[price > 10]`)
    Stream(SingleInputStream),
    /// `first` then `second`
    Next {
        first: Box<StateElement>,
        second: Box<StateElement>,
    },
    /// Repeatable wrapper: `every (...)`
    Every(Box<StateElement>),
    /// Repetition bounds on a leaf source; `None` means unbounded
    Count {
        stream: SingleInputStream,
        min: Option<u32>,
        max: Option<u32>,
    },
    /// Both occur, in either order
    And {
        left: SingleInputStream,
        right: SingleInputStream,
    },
    /// Either occurs
    Or {
        left: SingleInputStream,
        right: SingleInputStream,
    },
    /// `not a and b`: `absent` failed to occur before `present` occurred
    NotAnd {
        absent: SingleInputStream,
        present: SingleInputStream,
    },
    /// Bare negation with no paired operand
    Not(SingleInputStream),
}

/// Expression tree. Precedence is fixed at parse time; the tree shape is
/// the only source of evaluation order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    Constant(Constant),
    Variable(Variable),
    Binary {
        op: BinaryOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    /// Logical negation: `not expr`
    Not(Box<Expression>),
    /// Membership test against a table or window: `expr in TableName`
    In {
        expr: Box<Expression>,
        source_id: String,
    },
    /// `x is null` over an attribute, stream or inner stream
    IsNull(NullCheck),
    Function(FunctionCall),
}

/// Typed literal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Bool(bool),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(String),
    Time(TimeConstant),
}

/// A composite time literal reduced to milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeConstant {
    pub millis: i64,
}

impl TimeConstant {
    pub fn millis(millis: i64) -> Self {
        TimeConstant { millis }
    }

    pub fn value(&self) -> i64 {
        self.millis
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    And,
    Or,
    Add,
    Subtract,
    Multiply,
    Divide,
    Mod,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanEqual,
    LessThan,
    LessThanEqual,
}

impl BinaryOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Equal => "==",
            BinaryOp::NotEqual => "!=",
            BinaryOp::GreaterThan => ">",
            BinaryOp::GreaterThanEqual => ">=",
            BinaryOp::LessThan => "<",
            BinaryOp::LessThanEqual => "<=",
        }
    }
}

/// Resolved attribute reference.
///
/// `stream_index` of -1 means `last`; -1 - n means `last - n`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Variable {
    pub stream_id: Option<String>,
    pub is_inner_stream: bool,
    pub stream_index: Option<i32>,
    pub function_id: Option<String>,
    pub function_index: Option<i32>,
    pub attribute: String,
}

impl Variable {
    pub fn attribute(name: impl Into<String>) -> Self {
        Variable {
            attribute: name.into(),
            ..Variable::default()
        }
    }

    pub fn of_stream(stream_id: impl Into<String>, attribute: impl Into<String>) -> Self {
        Variable {
            stream_id: Some(stream_id.into()),
            attribute: attribute.into(),
            ..Variable::default()
        }
    }
}

/// What a null check inspects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NullCheck {
    /// `price is null`
    Attribute(Variable),
    /// `S is null` where `S` is an active stream
    Stream {
        stream_id: String,
        index: Option<i32>,
    },
    /// `#Inner is null`
    InnerStream {
        stream_id: String,
        index: Option<i32>,
    },
}

/// Function-call shape shared by expressions, stream functions and
/// windows. A set namespace marks an extension: `str:concat(a, b)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub namespace: Option<String>,
    pub name: String,
    pub args: Vec<Expression>,
}

impl FunctionCall {
    pub fn is_extension(&self) -> bool {
        self.namespace.is_some()
    }
}

/// Projection clause of a query. An empty attribute list means `select *`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Selector {
    pub attributes: Vec<OutputAttribute>,
    pub group_by: Vec<Variable>,
    pub having: Option<Expression>,
}

/// One projected column: a bare attribute or an aliased expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputAttribute {
    pub alias: Option<String>,
    pub expr: Expression,
}

/// Output clause of a query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OutputStream {
    /// `insert into Target`
    Insert {
        target: String,
        is_inner_stream: bool,
        event_type: OutputEventType,
    },
    /// `delete Target on condition`
    Delete {
        target: String,
        event_type: OutputEventType,
        condition: Expression,
    },
    /// `update Target on condition`
    Update {
        target: String,
        event_type: OutputEventType,
        condition: Expression,
    },
    /// `return` (the default for anonymous queries)
    Return { event_type: OutputEventType },
}

/// Which event instances a query emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OutputEventType {
    #[default]
    CurrentEvents,
    AllEvents,
    AllRawEvents,
    ExpiredEvents,
    ExpiredRawEvents,
}

/// Output rate limiting policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OutputRate {
    /// `output last every 5 sec`
    Time {
        millis: i64,
        policy: OutputRatePolicy,
    },
    /// `output first every 10 events`
    Events { count: u64, policy: OutputRatePolicy },
    /// `output snapshot every 1 min`
    Snapshot { millis: i64 },
}

/// Which subset of the buffered output a rate limiter emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OutputRatePolicy {
    #[default]
    All,
    First,
    Last,
}

/// Partition: scoped query group keyed per stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub annotations: Vec<Annotation>,
    pub partition_types: Vec<PartitionType>,
    pub queries: Vec<Query>,
}

/// Per-stream partitioning key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PartitionType {
    /// `symbol of StockStream`
    Value {
        stream_id: String,
        expr: Expression,
    },
    /// `price < 10 as 'cheap' or price >= 10 as 'dear' of StockStream`
    Range {
        stream_id: String,
        ranges: Vec<RangePartition>,
    },
}

/// One labelled condition range of a range partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangePartition {
    pub condition: Expression,
    pub label: String,
}

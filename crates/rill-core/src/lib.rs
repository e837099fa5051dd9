//! Core data model for Rill
//!
//! This crate defines the execution-plan AST produced by the RillQL
//! compiler front end:
//!
//! - [`ast`] - execution plans, definitions, queries, partitions,
//!   patterns/sequences and expressions
//!
//! The AST is consumed by the query planner and runtime, which map
//! window and rate-limit descriptors to concrete processing strategies.

pub mod ast;

pub use ast::{
    Annotation, AnnotationElement, Attribute, AttributeType, BinaryOp, Constant, ExecutionElement,
    ExecutionPlan, Expression, FunctionCall, FunctionDefinition, InputStream, JoinInputStream,
    JoinTrigger, JoinType, NullCheck, OutputAttribute, OutputEventType, OutputRate,
    OutputRatePolicy, OutputStream, Partition, PartitionType, Query, RangePartition, Selector,
    SingleInputStream, StateElement, StateElementKind, StateInputStream, StateKind,
    StreamDefinition, StreamHandler, TableDefinition, TimeConstant, Variable,
};

//! RillQL parser
//!
//! Compiles RillQL source text into the [`rill_core::ast::ExecutionPlan`]
//! tree. The surface syntax is defined in `rillql.pest`; [`parse`] is the
//! single entry point.
//!
//! ```
//! let plan = rill_parser::parse(
//!     "define stream StockStream (symbol string, price double); \
//!      from StockStream[price > 100] select symbol insert into Alerts",
//! )
//! .unwrap();
//! assert_eq!(plan.execution_elements.len(), 1);
//! ```

mod builder;
mod error;
mod scope;
mod time;

pub use builder::{parse, RillParser, Rule};
pub use error::{CompileError, ParseResult};
pub use scope::StreamScope;

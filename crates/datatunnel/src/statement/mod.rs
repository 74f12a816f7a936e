//! DATATUNNEL statement grammar and job plan
//!
//! Statement text is only ever tokenized and parsed; option values are
//! carried as typed values in the plan and never spliced back into text
//! except through the escaping canonical renderer.

mod lexer;
mod parser;
mod plan;

pub use parser::parse;
pub use plan::{ConnectorRole, ConnectorSpec, TunnelJobPlan, RESULT_TABLE_NAME};

pub mod session;
pub mod turn;

pub use session::SessionRow;
pub use turn::{
    NewToolInvocation, NewToolResult, NewTurn, ToolInvocationRow, ToolResultRow, TurnRecord,
    TurnRow,
};

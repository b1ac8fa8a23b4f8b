pub mod core;
pub mod exchanges;
pub mod oracle;
pub mod strategies;
pub mod utils;

pub use crate::core::{config::*, error::*, exchange::*, types::*};
pub use crate::exchanges::{build_gateway, OkxGateway, PaperExchange};
pub use crate::oracle::{
    build_oracle, DecisionOracle, HeuristicOracle, OpenAiCompatOracle, OracleError,
};
pub use crate::strategies::ai_directional::{
    LifecyclePhase, Pause, PositionLifecycleController, PositionSizer, SizePlan, TradeJournal,
};

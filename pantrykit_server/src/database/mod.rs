pub mod connection;
pub mod sweeper;
pub mod transaction;

pub use connection::{ConnectionMetrics, ConnectionStateMachine, ConnectionStatus, PoolFactory};
pub use transaction::{TransactionRuntime, TxSession};

pub mod app_config;
pub mod database;
pub mod order_repo;
pub mod payment_gateway;

pub use app_config::Config;
pub use database::DbClient;
pub use order_repo::PgOrderStore;
pub use payment_gateway::HttpPaymentGateway;

use log::error;

use tollgate::api::server::start_gateway;
use tollgate::gateway::pipeline::GatewayState;
use tollgate::GatewayConfig;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match GatewayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {:#}", e);
            std::process::exit(1);
        }
    };

    let state = match GatewayState::init(config).await {
        Ok(state) => state,
        Err(e) => {
            error!("startup failed: {:#}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = start_gateway(state).await {
        error!("gateway stopped with error: {:#}", e);
        std::process::exit(1);
    }
}

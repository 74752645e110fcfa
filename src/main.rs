use samil_bridge::prelude::*;

#[tokio::main]
async fn main() {
    let options = Options::new();

    if let Err(e) = samil_bridge::app(options).await {
        error!("Application error: {:#}", e);
        std::process::exit(255);
    }
}

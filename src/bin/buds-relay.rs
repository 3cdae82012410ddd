use buds_relay::web;

#[tokio::main]
async fn main() {
    web::run().await;
}

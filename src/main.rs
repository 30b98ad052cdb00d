#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    sensor_poller::run().await
}

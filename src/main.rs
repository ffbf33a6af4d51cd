use mnemq::error::Error;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    mnemq::run()
        .processors(|_service| async { Ok::<_, Error>(()) })
        .start()
        .await
}

use clap::Parser;

use vmdrive_launcher::Invocation;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let invocation = Invocation::parse();
    let code = vmdrive_launcher::launch(&invocation).await;
    std::process::exit(code);
}

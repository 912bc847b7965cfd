mod server;

use std::env;

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() > 2 && args[1].as_str() == "serve" {
        println!("Starting relay server for {}...", args[2]);
        if let Err(e) = server::main(&args[2]) {
            println!("Server error:\n{:#}", e);
            std::process::exit(1);
        }
    } else {
        print_usage();
    }
}

fn print_usage() {
    println!("Ingest RTC");
    println!("Usage:");
    println!("  ingest-rtc serve <upstream>  - Relay an RTMP stream to a WebRTC peer");
    println!();
    println!("Upstream form: rtmp://host[:port]/app/stream-key");
    println!("Config: set INGEST_RTC_CONFIG to a JSON file, RUST_LOG for log levels");
}

//! Decodes a captured stream from disk.
//!
//! ```text
//! cargo run --example decode_file -- sse capture.txt
//! cargo run --example decode_file -- structured records.ndjson
//! ```

use llmproxy_stream::body::from_chunks;
use llmproxy_stream::init_observability;
use llmproxy_stream::prelude::*;
use llmproxy_stream::ChatCollector;

// Small chunks so frames straddle read boundaries like they do on the wire.
const CHUNK_SIZE: usize = 64;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_observability();

    let mut args = std::env::args().skip(1);
    let (Some(format), Some(path)) = (args.next(), args.next()) else {
        eprintln!("usage: decode_file <sse|ndjson|structured> <path>");
        std::process::exit(2);
    };
    let bytes = std::fs::read(&path)?;
    let chunks: Vec<Vec<u8>> = bytes.chunks(CHUNK_SIZE).map(<[u8]>::to_vec).collect();
    let options = SessionOptions::new("decode-file").budgets(TimeoutBudgets::from_env()?);

    match format.as_str() {
        "sse" | "ndjson" => {
            let format = if format == "sse" {
                ChatFormat::Sse
            } else {
                ChatFormat::Ndjson
            };
            let mut session = StreamSession::new(from_chunks(chunks), format, options);
            let mut collector = ChatCollector::new(format);
            while let Some(event) = session.next().await? {
                println!("{:<14} {}", event.kind.as_str(), event.raw_text());
                collector.push(&event);
            }
            let response = collector.finish();
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        "structured" => {
            let mut stream =
                StructuredStream::<serde_json::Value>::new(from_chunks(chunks), options);
            while let Some(event) = stream.next().await? {
                println!("{:<10} {}", event.kind.as_str(), event.payload);
                if event.is_completion() {
                    break;
                }
            }
        }
        other => {
            eprintln!("unknown format {other:?}");
            std::process::exit(2);
        }
    }
    Ok(())
}

use std::io;
use std::path::PathBuf;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use futures_util::Stream;
use object_gateway::protocol::envelope::{encode_cookie, EnvelopeFormat};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, RANGE};
use serde_json::json;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Upload read size.
const UPLOAD_CHUNK: usize = 64 * 1024;

#[derive(Parser)]
#[command(name = "gateway-cli")]
#[command(about = "Client for the object gateway protocol", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8080")]
    url: String,

    /// Ask for binary envelopes instead of XML
    #[arg(long)]
    binary: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a file as a new object
    Store {
        file: PathBuf,
        #[arg(long)]
        cache: Option<String>,
        /// Commit every N bytes and print each acknowledged chunk
        #[arg(long)]
        chunk_size: Option<u64>,
    },
    /// Download an object, optionally a byte range of it
    Retrieve {
        id: String,
        /// Range in `first-last` or `first-` form
        #[arg(long)]
        range: Option<String>,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print an object's metadata record
    Metadata { id: String },
    /// Run a query and print its hits as JSON lines
    Query {
        #[arg(long)]
        cache: Option<String>,
        #[arg(short, long)]
        text: Option<String>,
        #[arg(long)]
        max: Option<u32>,
        /// Comma-separated fields to return
        #[arg(long)]
        select: Option<String>,
        /// Use the streamed query endpoint
        #[arg(long)]
        plus: bool,
        /// Follow cookies until the result set is exhausted
        #[arg(long)]
        all: bool,
    },
    /// Print the node's protocol statistics
    Stats,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let format = EnvelopeFormat::from_binary_flag(cli.binary);
    let binary = if cli.binary { "1" } else { "0" };

    match cli.command {
        Commands::Store {
            file,
            cache,
            chunk_size,
        } => {
            let file = File::open(&file).await?;
            let mut headers = HeaderMap::new();
            if let Some(chunk) = chunk_size {
                headers.insert("x-chunk-size", HeaderValue::from(chunk));
            }
            let mut query = vec![("binary", binary.to_string())];
            if let Some(cache) = cache {
                query.push(("cache", cache));
            }
            let res = client
                .post(format!("{}/store", cli.url))
                .headers(headers)
                .query(&query)
                .body(reqwest::Body::wrap_stream(file_chunks(file)))
                .send()
                .await?;
            let res = check(res).await?;
            // No `TE: trailers` is sent, so a failure after the head arrives
            // drops the connection instead of completing the body.
            let body = res
                .bytes()
                .await
                .map_err(|e| format!("store failed after the upload was accepted: {}", e))?;
            let (acks, envelope) = split_acknowledgments(&body);
            for index in acks {
                eprintln!("chunk {} committed", index);
            }
            let meta = format.decode_object(envelope)?;
            println!("{}", serde_json::to_string_pretty(&meta)?);
        }
        Commands::Retrieve { id, range, output } => {
            let mut request = client.get(format!("{}/retrieve/{}", cli.url, id));
            if let Some(range) = range {
                request = request.header(RANGE, range);
            }
            let mut res = check(request.send().await?).await?;
            let mut sink: Box<dyn tokio::io::AsyncWrite + Unpin> = match output {
                Some(path) => Box::new(File::create(path).await?),
                None => Box::new(tokio::io::stdout()),
            };
            while let Some(chunk) = res
                .chunk()
                .await
                .map_err(|e| format!("retrieve failed mid-stream: {}", e))?
            {
                sink.write_all(&chunk).await?;
            }
            sink.flush().await?;
        }
        Commands::Metadata { id } => {
            let res = client
                .get(format!("{}/retrieve-metadata/{}", cli.url, id))
                .send()
                .await?;
            let res = check(res).await?;
            let is_json = res
                .headers()
                .get(CONTENT_TYPE)
                .is_some_and(|v| v.as_bytes().starts_with(b"application/json"));
            let body = res.bytes().await?;
            if is_json {
                let value: serde_json::Value = serde_json::from_slice(&body)?;
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("{}", String::from_utf8_lossy(&body));
            }
        }
        Commands::Query {
            cache,
            text,
            max,
            select,
            plus,
            all,
        } => {
            let endpoint = if plus { "query-plus" } else { "query" };
            let mut cookie: Option<Vec<u8>> = None;
            loop {
                let mut query = vec![("binary", binary.to_string())];
                if let Some(cache) = &cache {
                    query.push(("cache", cache.clone()));
                }
                if let Some(max) = max {
                    query.push(("max", max.to_string()));
                }
                match &cookie {
                    Some(cookie) => query.push(("cookie", encode_cookie(cookie))),
                    None => {
                        if let Some(text) = &text {
                            query.push(("q", text.clone()));
                        }
                        if let Some(select) = &select {
                            query.push(("select", select.clone()));
                        }
                    }
                }

                let res = client
                    .get(format!("{}/{}", cli.url, endpoint))
                    .query(&query)
                    .send()
                    .await?;
                let body = check(res).await?.bytes().await?;
                let page = format.decode_query_result(&body)?;
                for hit in &page.hits {
                    println!("{}", json!({ "id": hit.id.as_str(), "fields": hit.fields }));
                }
                eprintln!(
                    "{} hits, integrity time {}",
                    page.terminal.count, page.terminal.integrity_time
                );

                match page.terminal.cookie {
                    Some(next) if all => cookie = Some(next),
                    _ => break,
                }
            }
        }
        Commands::Stats => {
            let res = client.get(format!("{}/stats", cli.url)).send().await?;
            let res = check(res).await?;
            let value: serde_json::Value = res.json().await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
    }

    Ok(())
}

/// Turn a non-2xx response into an error carrying the gateway's reason.
async fn check(res: reqwest::Response) -> Result<reqwest::Response, Box<dyn std::error::Error>> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let reason = res
        .headers()
        .get("x-error-reason")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let text = res.text().await.unwrap_or_default();
    Err(format!(
        "gateway returned {}: {}",
        status,
        reason.unwrap_or(text)
    )
    .into())
}

/// Read `file` as a stream of body chunks.
fn file_chunks(mut file: File) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
    async_stream::try_stream! {
        let mut buf = vec![0u8; UPLOAD_CHUNK];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            yield Bytes::copy_from_slice(&buf[..n]);
        }
    }
}

/// Split the hex chunk acknowledgments off the front of a store response.
fn split_acknowledgments(body: &[u8]) -> (Vec<u64>, &[u8]) {
    let mut acks = Vec::new();
    let mut rest = body;
    while let Some(end) = rest.iter().position(|b| *b == b'\n') {
        let line = &rest[..end];
        if line.is_empty() || line.len() >= 16 || !line.iter().all(u8::is_ascii_hexdigit) {
            break;
        }
        let Some(index) = std::str::from_utf8(line)
            .ok()
            .and_then(|s| u64::from_str_radix(s, 16).ok())
        else {
            break;
        };
        acks.push(index);
        rest = &rest[end + 1..];
    }
    (acks, rest)
}

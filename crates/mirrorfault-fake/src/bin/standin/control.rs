//! Control socket: one command per connection, one reply line.
//!
//! A command is either all its tokens on one line, or one token per line
//! ended by a blank line.

use std::{net::IpAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{UnixListener, UnixStream},
};

use crate::{Server, mirror};

/// How long a client may take to send its first line.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for a further token once a lone verb has arrived.
const CONTINUATION_TIMEOUT: Duration = Duration::from_millis(250);

pub async fn serve(listener: UnixListener, server: Arc<Server>) {
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(e) => {
                tracing::error!(error = %e, "accepting control clients failed");
                return;
            },
        };
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(e) = session(stream, &server).await {
                tracing::warn!(error = %e, "control session failed");
            }
        });
    }
}

async fn session(stream: UnixStream, server: &Arc<Server>) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);
    let Some(tokens) = read_command(&mut reader).await? else {
        return Ok(());
    };
    tracing::debug!(?tokens, "control command");

    let reply = match tokens.split_first() {
        None => "9: missing command".to_string(),
        Some((verb, args)) => dispatch(server, verb, args).await,
    };
    tracing::info!(%reply, "control reply");

    let mut stream = reader.into_inner();
    stream.write_all(format!("{reply}\n").as_bytes()).await?;
    stream.shutdown().await
}

async fn read_command(reader: &mut BufReader<UnixStream>) -> std::io::Result<Option<Vec<String>>> {
    let mut line = String::new();
    let read = match tokio::time::timeout(COMMAND_TIMEOUT, reader.read_line(&mut line)).await {
        Ok(read) => read?,
        Err(_) => return Ok(None),
    };
    if read == 0 {
        return Ok(None);
    }

    let mut tokens: Vec<String> = line.split_whitespace().map(str::to_string).collect();
    if tokens.len() != 1 || matches!(tokens[0].as_str(), "status" | "break") {
        return Ok(Some(tokens));
    }

    loop {
        line.clear();
        let Ok(read) = tokio::time::timeout(CONTINUATION_TIMEOUT, reader.read_line(&mut line)).await
        else {
            break;
        };
        if read? == 0 || line.trim().is_empty() {
            break;
        }
        tokens.extend(line.split_whitespace().map(str::to_string));
    }
    Ok(Some(tokens))
}

async fn dispatch(server: &Arc<Server>, verb: &str, args: &[String]) -> String {
    match verb {
        "mirror" => start_mirror(server, args).await,
        "acl" => match parse_acl(args) {
            Ok(acl) => {
                tracing::info!(?acl, "access list replaced");
                *server.acl.write().await = acl;
                "0: updated".to_string()
            },
            Err(bad) => format!("1: bad spec: {bad}"),
        },
        "status" => {
            let mirroring = server.mirror.lock().await.as_ref().is_some_and(|t| !t.is_finished());
            format!("0: pid={} mirroring={mirroring}", std::process::id())
        },
        "break" => match server.mirror.lock().await.take() {
            Some(task) if !task.is_finished() => {
                task.abort();
                tracing::info!("mirror stopped by operator");
                "0: mirror stopped".to_string()
            },
            _ => "1: not mirroring".to_string(),
        },
        _ => "10: unknown command".to_string(),
    }
}

async fn start_mirror(server: &Arc<Server>, args: &[String]) -> String {
    let [ip, port] = args else {
        return "1: usage: mirror <ip> <port>".to_string();
    };
    let (Ok(ip), Ok(port)) = (ip.parse::<IpAddr>(), port.parse::<u16>()) else {
        return format!("1: bad destination: {ip} {port}");
    };

    let mut running = server.mirror.lock().await;
    if running.as_ref().is_some_and(|t| !t.is_finished()) {
        return "1: already mirroring".to_string();
    }

    match mirror::open(ip, port, server).await {
        Ok(destination) => {
            *running = Some(tokio::spawn(mirror::migrate(destination, Arc::clone(server))));
            "0: mirror started".to_string()
        },
        Err(e) => {
            tracing::error!("{e}");
            format!("1: {e}")
        },
    }
}

/// Parse every entry, or name the first that is not an address.
fn parse_acl(args: &[String]) -> Result<Vec<IpAddr>, &str> {
    args.iter().map(|entry| entry.parse::<IpAddr>().map_err(|_| entry.as_str())).collect()
}

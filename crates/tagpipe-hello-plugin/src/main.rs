use anyhow::Result;
use std::env;
use std::io::{self, Write};
use std::process;
use tagpipe_core::serve::{self, RuntimeConfig};
use tagpipe_core::session::{Control, HandlerError};
use tagpipe_core::tag::{self, Tag};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // stdout carries protocol bytes in filter mode; diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let config = match env::var("TAGPIPE_KEY_FILE") {
        Ok(path) if !path.trim().is_empty() => RuntimeConfig::with_key_path(path),
        _ => RuntimeConfig::from_home()?,
    };

    info!("starting {}", env::args().next().unwrap_or_default());

    match env::var("TAGPIPE_HELLO_MODE").as_deref() {
        Ok("filter") => serve::run_filter(&config, &hello)?,
        Ok("server") => serve::run_server(config, hello)?,
        _ => serve::auto_run(config, hello)?,
    }
    Ok(())
}

fn hello(request: &Tag, out: &mut dyn Write) -> Result<Control, HandlerError> {
    debug!("got tag: {request:?}");
    match request.get("cmd").map(String::as_str) {
        Some("open_url") => {
            let url = request.get("url").cloned().unwrap_or_default();
            let mut reply = Tag::new();
            reply.insert("cmd".to_string(), "start_send_page".to_string());
            reply.insert("url".to_string(), url.clone());
            tag::write_tag(out, &reply)?;
            out.write_all(b"Content-Type: text/html\r\n\r\n")?;
            writeln!(out, "<h1>Hello world {url}</h1>")?;
            out.flush()?;
            Ok(Control::Done)
        }
        Some("DpiBye") => {
            info!("host said bye");
            process::exit(0);
        }
        _ => Ok(Control::Continue),
    }
}

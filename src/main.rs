// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

use ouija::{datagram, stream, Config, DatagramTuning, Error, Mode, Protocol, StreamTuning, Telemetry};

use tracing_subscriber::EnvFilter;

use std::{path::Path, process::ExitCode, sync::Arc};

#[tokio::main]
async fn main() -> ExitCode {
    let Some(path) = std::env::args().nth(1) else {
        eprintln!("usage: ouija <config.json>");
        return ExitCode::from(2);
    };

    let config = match Config::load(Path::new(&path)) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("{error}");
            return ExitCode::FAILURE;
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if config.debug { "debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("{error}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> ouija::Result<()> {
    let telemetry = Arc::new(Telemetry::default());

    match (config.protocol, config.mode) {
        (Protocol::Tcp, Mode::Relay) => {
            let (relay_host, relay_port) = ingress(&config)?;
            let relay = stream::Relay::new(
                telemetry,
                StreamTuning::from_config(&config)?,
                relay_host,
                relay_port,
                config.proxy_host,
                config.proxy_port,
            );

            if config.monitor {
                tokio::spawn(Arc::clone(&relay).monitor());
            }
            relay.serve().await
        }
        (Protocol::Tcp, Mode::Proxy) => {
            let proxy = stream::Proxy::new(
                telemetry,
                StreamTuning::from_config(&config)?,
                config.proxy_host,
                config.proxy_port,
            );

            if config.monitor {
                tokio::spawn(Arc::clone(&proxy).monitor());
            }
            proxy.serve().await
        }
        (Protocol::Udp, Mode::Relay) => {
            let (relay_host, relay_port) = ingress(&config)?;
            let relay = datagram::Relay::new(
                telemetry,
                DatagramTuning::from_config(&config)?,
                relay_host,
                relay_port,
                config.proxy_host,
                config.proxy_port,
            );

            if config.monitor {
                tokio::spawn(Arc::clone(&relay).monitor());
            }
            relay.serve().await
        }
        (Protocol::Udp, Mode::Proxy) => {
            let proxy = datagram::Proxy::new(
                telemetry,
                DatagramTuning::from_config(&config)?,
                config.proxy_host,
                config.proxy_port,
            );

            if config.monitor {
                tokio::spawn(Arc::clone(&proxy).monitor());
            }
            proxy.serve().await
        }
    }
}

fn ingress(config: &Config) -> ouija::Result<(String, u16)> {
    let host = config
        .relay_host
        .clone()
        .ok_or_else(|| Error::Config(String::from("relay_host is required in RELAY mode")))?;
    let port = config
        .relay_port
        .ok_or_else(|| Error::Config(String::from("relay_port is required in RELAY mode")))?;

    Ok((host, port))
}

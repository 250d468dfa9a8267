use clap::Parser;
use common::ShutdownMessage;
use proxy::backend::pool::ConnectionPool;
use proxy::server::auth::CredentialCache;
use proxy::server::route_config::RouterServerArgs;
use proxy::server::router_server::RouterServer;
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tokio::sync::watch::Receiver;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;
use web_service::http_server::{RouterRest, RouterRestState};

async fn shutdown_await(mut shutdown_rx: Box<Receiver<ShutdownMessage>>) {
    let changed_rs = &shutdown_rx.changed().await;
    if changed_rs.is_ok() {
        let canceled = shutdown_rx.borrow_and_update().clone();
        if let ShutdownMessage::Cancel(msg) = canceled {
            info!("SqlRouter process receive shutdown msg {msg}");
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> ShutdownMessage {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        ctrl_c_v = ctrl_c => {
            let msg = format!("SqlRouter receive ctrl_c signal  {ctrl_c_v:?}");
            ShutdownMessage::Cancel(msg)
        },
        v = terminate => {
            let msg =  format!("SqlRouter receive terminate signal  {v:?}");
            ShutdownMessage::Cancel(msg)
        },
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> ShutdownMessage {
    let ctrl_c_v = tokio::signal::ctrl_c().await;
    ShutdownMessage::Cancel(format!("SqlRouter receive ctrl_c signal  {ctrl_c_v:?}"))
}

fn start_metrics_and_rest(
    args: &RouterServerArgs,
    runtime: &Runtime,
    shutdown_rx: &Receiver<ShutdownMessage>,
    rest_state: RouterRestState,
) {
    if !args.enable_metrics && !args.enable_rest {
        return;
    }
    if args.enable_metrics {
        common::metrics::init_metrics_context();
    }

    let http_port = args.http_port;
    let enable_metrics = args.enable_metrics;
    let shutdown_rx_clone = Box::new(shutdown_rx.clone());
    runtime.spawn(async move {
        RouterRest::start_server(
            "0.0.0.0".to_string(),
            http_port,
            enable_metrics,
            rest_state,
            shutdown_await(shutdown_rx_clone),
        )
        .await
    });
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = RouterServerArgs::parse();
    let log_level_string = args.log_level.clone().unwrap_or("INFO".to_string());
    let level = Level::from_str(log_level_string.as_str())?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("INFO,hyper=INFO,tower=INFO,h2=INFO"))
        .add_directive(level.into())
        .add_directive("hyper=INFO".parse().unwrap())
        .add_directive("h2=INFO".parse().unwrap())
        .add_directive("tower=INFO".parse().unwrap());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_line_number(true)
        .init();

    let workers = args.workers;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("SQL_ROUTER")
        .worker_threads(workers)
        .build()?;

    info!("SqlRouter running config args={:?}", args);
    let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownMessage::Init);

    runtime.block_on(async {
        let route = args.route_config()?;
        let pool = ConnectionPool::new(args.pool_config());
        let credentials = CredentialCache::new();
        let router_srv = Arc::new(RouterServer::new(
            route.clone(),
            Arc::clone(&pool),
            credentials,
        )?);

        start_metrics_and_rest(
            &args,
            &runtime,
            &shutdown_rx,
            RouterRestState::new(vec![Arc::clone(&router_srv)], Arc::clone(&pool)),
        );

        let tcp_listener = TcpListener::bind(&route.bind_addr).await?;
        info!("SqlRouter route {} listening on {}", route.name, route.bind_addr);

        loop {
            tokio::select! {
                shutdown_msg = shutdown_signal() => {
                    shutdown_tx.send(shutdown_msg.clone())?;
                    break;
                }
                rs = tcp_listener.accept() => {
                    match rs {
                        Ok((stream, _addr)) => {
                            let srv = Arc::clone(&router_srv);
                            tokio::spawn(async move {
                                if let Err(e) = srv.connect(stream).await {
                                    warn!("SqlRouter connection ended with error: {e:?}");
                                }
                            });
                        }
                        Err(e) => {
                            warn!("SqlRouter accept connection err. cause by {e:?}");
                        }
                    }
                }
            }
        }
        Ok::<(), Box<dyn std::error::Error>>(())
    })?;
    Ok(())
}

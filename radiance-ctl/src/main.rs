use exitcode::{self, ExitCode};
use serde::Serialize;

use std::process;

use radiance_lib::ipc::Client;
use radiance_lib::ipc::client::Error;

mod cli;

// Avoid musl's default allocator due to degraded performance
// https://nickb.dev/blog/default-musl-allocator-considered-harmful-to-performance
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() {
    let args = cli::parse();

    let socket_path = match args.socket_path {
        Some(path) => path,
        None => match Client::default_path() {
            Ok(path) => path,
            Err(e) => {
                eprintln!("Cannot determine socket path: {e}");
                process::exit(exitcode::CONFIG);
            }
        },
    };
    let client = Client::new(socket_path);

    let exit = match run(&client, args.command, args.json).await {
        Ok(_) => exitcode::OK,
        Err(e) => {
            eprintln!("{e}");
            determine_exitcode(&e)
        }
    };
    process::exit(exit);
}

async fn run(client: &Client, command: cli::Command, json: bool) -> Result<(), Error> {
    match command {
        cli::Command::Status {} => {
            let status = client.status().await?;
            if json {
                json_print(&serde_json::json!({"status": status}));
            } else {
                println!("{status}");
            }
        }
        cli::Command::Watch {} => {
            client
                .watch_status(|update| {
                    if json {
                        json_print(&update);
                    } else {
                        match &update.cause {
                            Some(cause) => println!("{} ({cause})", update.status),
                            None => println!("{}", update.status),
                        }
                    }
                })
                .await?;
        }
        cli::Command::Start { group, tag } => {
            let status = client.start(group, tag).await?;
            print_status(json, status);
        }
        cli::Command::Stop {} => {
            let status = client.stop().await?;
            print_status(json, status);
        }
        cli::Command::Restart {} => {
            let status = client.restart().await?;
            print_status(json, status);
        }
        cli::Command::Mode { mode } => match mode {
            Some(mode) => {
                client.set_clash_mode(&mode).await?;
                println!("mode set to {mode}");
            }
            None => {
                let mode = client.clash_mode().await?;
                if json {
                    json_print(&serde_json::json!({"mode": mode}));
                } else {
                    println!("{mode}");
                }
            }
        },
        cli::Command::Selected {} => {
            let selection = client.selected().await?;
            if json {
                json_print(&selection);
            } else {
                println!("{} / {}", selection.group_tag, selection.outbound_tag);
            }
        }
        cli::Command::Select { group, tag } => {
            client.select(&group, &tag).await?;
            println!("selected {tag} in {group}");
        }
        cli::Command::Active {} => {
            let active = client.active().await?;
            if json {
                json_print(&active);
            } else {
                println!("{} / {}", active.group_tag, active.outbound_tag);
            }
        }
        cli::Command::Groups {} => {
            let groups = client.groups().await?;
            if json {
                json_print(&groups);
            } else {
                for group in groups {
                    let selected = group.selected.unwrap_or_else(|| "-".to_string());
                    println!("{} [{}] -> {}", group.tag, group.kind, selected);
                    for child in group.children {
                        println!("  {child}");
                    }
                }
            }
        }
        cli::Command::Connections {} => {
            let connections = client.connections().await?;
            if json {
                json_print(&connections);
            } else if connections.is_empty() {
                println!("No tracked connections.");
            } else {
                for conn in connections {
                    println!(
                        "{} {} -> {} via {} (up {} B, down {} B)",
                        conn.id, conn.source, conn.destination, conn.outbound, conn.uplink, conn.downlink
                    );
                }
            }
        }
        cli::Command::CloseConnections { ids } => {
            client.close_connections(&ids).await?;
            println!("closed {} connection(s)", ids.len());
        }
        cli::Command::Metrics {} => {
            let metrics = client.metrics().await?;
            if json {
                json_print(&metrics);
            } else {
                println!(
                    "memory: {} B\ntasks: {}\nconnections: {}\nuplink: {} B\ndownlink: {} B",
                    metrics.memory, metrics.goroutines, metrics.connections, metrics.uplink_total, metrics.downlink_total
                );
            }
        }
    }
    Ok(())
}

fn print_status(json: bool, status: radiance_lib::status::Status) {
    if json {
        json_print(&serde_json::json!({"status": status}));
    } else {
        println!("{status}");
    }
}

fn json_print(value: &impl Serialize) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("Error serializing response to JSON: {e}"),
    }
}

fn determine_exitcode(err: &Error) -> ExitCode {
    match err {
        Error::ServiceNotRunning => exitcode::UNAVAILABLE,
        Error::Api { status, .. } if *status == 403 => exitcode::NOPERM,
        Error::Api { status, .. } if *status == 400 => exitcode::USAGE,
        Error::Api { .. } => exitcode::PROTOCOL,
        Error::Timeout => exitcode::TEMPFAIL,
        _ => exitcode::IOERR,
    }
}

// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present rinode Contributors

//! The rinode daemon: brings up the IPCPs described in a configuration
//! file, restores persisted registrations and keeps the node running.

use std::collections::HashMap;
use std::path::PathBuf;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rinode::config::{DaemonConfig, load_registrations};
use rinode::msg::{CtrlMsg, MsgBody};
use rinode::uipcp::{Uipcp, UipcpHandle};
use rinode::{ApplName, CtrlHandle, Node, Result};

#[derive(Parser, Debug)]
#[command(name = "rinode")]
#[command(about = "Recursive IPC node daemon", long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log filter, e.g. "info" or "rinode=debug".
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log)),
        )
        .init();

    if let Err(e) = run(args).await {
        eprintln!("rinode: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => DaemonConfig::from_file(path)?,
        None => DaemonConfig::default(),
    };

    let node = Node::with_builtin_factories();
    let admin = CtrlHandle::open(&node);
    let mut uipcps: HashMap<String, UipcpHandle> = HashMap::new();

    for decl in &config.ipcps {
        let name: ApplName = decl.name.parse()?;
        let ipcp_id = node.ipcp_add(&name, &decl.ipcp_type, &decl.dif)?;
        for (key, value) in &decl.params {
            node.ipcp_config(ipcp_id, key, value)?;
        }
        if decl.ipcp_type == "normal" {
            let handle = Uipcp::spawn(&node, ipcp_id).await?;
            for dif in &decl.lower_difs {
                handle.register_lower_dif(dif).await?;
            }
            uipcps.insert(decl.name.clone(), handle);
        }
        info!(name = %decl.name, dif = %decl.dif, "ipcp up");
    }

    // Startup enrollments, after every IPCP exists.
    for decl in &config.ipcps {
        let (Some(neigh), Some(supp_dif)) = (&decl.enroll_neighbor, &decl.enroll_supp_dif) else {
            continue;
        };
        let Some(handle) = uipcps.get(&decl.name) else {
            continue;
        };
        let neigh: ApplName = neigh.parse()?;
        match handle.enroll(&neigh, supp_dif).await {
            Ok(()) => info!(ipcp = %decl.name, neigh = %neigh, "enrolled"),
            Err(e) => warn!(ipcp = %decl.name, neigh = %neigh, error = %e, "enrollment failed"),
        }
    }

    // Restore persisted application registrations.
    if let Some(path) = &config.registrations_file {
        for reg in load_registrations(path)? {
            let appl: ApplName = reg.appl_name.parse()?;
            let res = admin
                .write_msg(&CtrlMsg::new(
                    1,
                    MsgBody::ApplRegister {
                        dif_name: reg.dif.clone(),
                        reg: true,
                        appl_name: appl,
                    },
                ))
                .await;
            match res {
                Ok(()) => info!(appl = %reg.appl_name, dif = %reg.dif, "registration restored"),
                Err(e) => {
                    warn!(appl = %reg.appl_name, dif = %reg.dif, error = %e,
                        "could not restore registration")
                }
            }
        }
    }

    info!("node is up, waiting for shutdown");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}

// src/bin/dnsmasq_lease.rs

//! `--dhcp-script` target invoked by `dnsmasq` on every lease event.
//! Ported from `original_source/dnsmasq-lease.py`: translates dnsmasq's
//! argv/environment convention into a JSON POST against the daemon's
//! `/checkin/dnsmasq` route. Kept a standalone binary (rather than a
//! daemon subcommand) since dnsmasq execs it fresh on every lease.

use clap::Parser;
use serde_json::json;

#[derive(Parser, Debug)]
#[command(name = "dnsmasq-lease")]
struct Cli {
    /// Address the checkin API listens on. Matches `dhcp.rs`'s
    /// `lease_script_command`, which bakes this in as a fixed
    /// `--dhcp-script` argument ahead of dnsmasq's own action/mac/ip.
    #[arg(long)]
    api_address: String,

    #[arg(long)]
    api_port: u16,

    /// dnsmasq's own arguments: `add <mac> <ip>`, `old <mac> <ip>`,
    /// `del <mac> <ip>`, or `tftp <size> <destaddr> <filepath>`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    action_args: Vec<String>,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    let Some(action) = cli.action_args.first() else {
        eprintln!("dnsmasq-lease: missing action argument");
        return std::process::ExitCode::FAILURE;
    };

    let body = match action.as_str() {
        "add" | "old" | "del" => {
            let macaddr = cli.action_args.get(1);
            let ipaddr = cli.action_args.get(2);
            json!({
                "action": action,
                "macaddr": macaddr,
                "ipaddr": ipaddr,
                "hostname": std::env::var("DNSMASQ_SUPPLIED_HOSTNAME").ok(),
                "client_id": std::env::var("DNSMASQ_CLIENT_ID").ok(),
                "vendor_class": std::env::var("DNSMASQ_VENDOR_CLASS").ok(),
                "user_class": std::env::var("DNSMASQ_USER_CLASS0").ok(),
            })
        }
        "tftp" => {
            json!({
                "action": "tftp",
                "size": cli.action_args.get(1),
                "destaddr": cli.action_args.get(2),
                "filepath": cli.action_args.get(3),
            })
        }
        other => {
            eprintln!("dnsmasq-lease: unrecognized action '{other}', ignoring");
            return std::process::ExitCode::SUCCESS;
        }
    };

    let uri = format!("http://{}:{}/checkin/dnsmasq", cli.api_address, cli.api_port);
    let client = match reqwest::Client::builder().build() {
        Ok(client) => client,
        Err(e) => {
            eprintln!("dnsmasq-lease: failed to build HTTP client: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    match client.post(uri.as_str()).json(&body).send().await {
        Ok(resp) if resp.status().is_success() => std::process::ExitCode::SUCCESS,
        Ok(resp) => {
            eprintln!("dnsmasq-lease: checkin API returned {}", resp.status());
            std::process::ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("dnsmasq-lease: failed to reach checkin API: {e}");
            // Never fail the dnsmasq lease transaction over a notification
            // hiccup: dnsmasq treats a nonzero script exit as cause to
            // refuse the lease.
            std::process::ExitCode::SUCCESS
        }
    }
}

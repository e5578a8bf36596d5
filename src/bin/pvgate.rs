use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8080";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() -> CliResult<()> {
    let mode_arg = || {
        Arg::with_name("mode")
            .help("Routing mode")
            .required(true)
            .possible_values(&["stop", "off", "force", "on", "auto"])
    };

    let matches = App::new("pvgate")
        .version(env!("CARGO_PKG_VERSION"))
        .about("☀️  Command line client for the PV router gateway")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("host")
                .short("H")
                .long("host")
                .value_name("HOST")
                .help("Gateway host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Gateway API port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table"])
                .default_value("table")
                .global(true),
        )
        .subcommand(SubCommand::with_name("status").about("📊 Gateway, link and scheduler status"))
        .subcommand(SubCommand::with_name("stats").about("⚡ Latest controller measurements"))
        .subcommand(SubCommand::with_name("params").about("🔧 Controller parameters"))
        .subcommand(
            SubCommand::with_name("set-param")
                .about("Write one controller parameter")
                .arg(Arg::with_name("field").help("Parameter name or index").required(true))
                .arg(
                    Arg::with_name("value")
                        .help("New value")
                        .required(true)
                        .validator(|v| match v.parse::<f64>() {
                            Ok(x) if x.is_finite() => Ok(()),
                            _ => Err("value must be a finite number".into()),
                        }),
                ),
        )
        .subcommand(SubCommand::with_name("triac").about("Set the triac routing mode").arg(mode_arg()))
        .subcommand(SubCommand::with_name("relay").about("Set the relay mode").arg(mode_arg()))
        .subcommand(
            SubCommand::with_name("boost")
                .about("🚀 Start or stop a boost")
                .arg(
                    Arg::with_name("state")
                        .help("Boost state")
                        .required(true)
                        .possible_values(&["on", "off"]),
                ),
        )
        .subcommand(
            SubCommand::with_name("history")
                .about("📈 Energy index history")
                .arg(Arg::with_name("csv").long("csv").help("Print as CSV")),
        )
        .subcommand(SubCommand::with_name("events").about("Recent gateway events"))
        .subcommand(SubCommand::with_name("refresh-params").about("Re-read the controller parameters"))
        .subcommand(SubCommand::with_name("save-config").about("Save the controller configuration to its EEPROM"))
        .subcommand(SubCommand::with_name("load-config").about("Reload the controller configuration from its EEPROM"))
        .subcommand(SubCommand::with_name("reset-indices").about("Reset the controller energy indices"))
        .subcommand(SubCommand::with_name("clear-history").about("Drop all history points"))
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse::<u16>()?;
    let format = matches.value_of("format").unwrap_or("table");
    let client = Client { host, port, format };

    match matches.subcommand() {
        ("status", _) => client.show_status().await,
        ("stats", _) => client.show_map("⚡ Controller Statistics", json!({"cmd": "stats"})).await,
        ("params", _) => client.show_map("🔧 Controller Parameters", json!({"cmd": "params"})).await,
        ("set-param", Some(sub)) => {
            let field = sub.value_of("field").unwrap_or_default();
            let value = sub.value_of("value").unwrap_or_default().parse::<f64>()?;
            client
                .command(&format!("{field} = {value}"), json!({"cmd": "set_param", "field": field, "value": value}))
                .await
        }
        ("triac", Some(sub)) => client.mode_command("triac", sub).await,
        ("relay", Some(sub)) => client.mode_command("relay", sub).await,
        ("boost", Some(sub)) => {
            let on = sub.value_of("state") == Some("on");
            client
                .command(if on { "boost on" } else { "boost off" }, json!({"cmd": "boost", "on": on}))
                .await
        }
        ("history", Some(sub)) => client.show_history(sub.is_present("csv")).await,
        ("events", _) => client.show_events().await,
        ("refresh-params", _) => client.command("parameter refresh", json!({"cmd": "refresh_params"})).await,
        ("save-config", _) => client.command("save configuration", json!({"cmd": "save_config"})).await,
        ("load-config", _) => client.command("load configuration", json!({"cmd": "load_config"})).await,
        ("reset-indices", _) => client.command("index reset", json!({"cmd": "reset_indices"})).await,
        ("clear-history", _) => client.command("history clear", json!({"cmd": "clear_history"})).await,
        _ => Ok(()),
    }
}

struct Client<'a> {
    host: &'a str,
    port: u16,
    format: &'a str,
}

impl Client<'_> {
    async fn request(&self, request: Value) -> CliResult<Value> {
        let addr = format!("{}:{}", self.host, self.port);
        let mut stream = match TcpStream::connect(&addr).await {
            Ok(stream) => stream,
            Err(e) => {
                eprintln!("{} Cannot reach the gateway at {}", "❌".red(), addr.bright_white());
                if e.kind() == std::io::ErrorKind::ConnectionRefused {
                    eprintln!("{} Is the daemon running? Start it with {}", "💡".yellow(), "pvgated".bright_cyan());
                }
                return Err(e.into());
            }
        };

        let line = tokio::time::timeout(REQUEST_TIMEOUT, async {
            let mut body = request.to_string();
            body.push('\n');
            stream.write_all(body.as_bytes()).await?;
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).await?;
            Ok::<_, std::io::Error>(line)
        })
        .await
        .map_err(|_| {
            eprintln!("{} Gateway did not answer within 5 seconds", "⏰".yellow());
            "request timeout"
        })??;

        if line.trim().is_empty() {
            return Err("gateway closed the connection".into());
        }
        Ok(serde_json::from_str(line.trim())?)
    }

    /// Returns the `data` member of a successful response, printing the
    /// failure otherwise.
    async fn fetch(&self, request: Value) -> CliResult<Option<Value>> {
        let response = self.request(request).await?;
        if response["ok"].as_bool() == Some(true) {
            Ok(Some(response["data"].clone()))
        } else {
            let message = response["message"].as_str().unwrap_or("request failed");
            eprintln!("{} {}", "❌".red(), message.bright_red());
            Ok(None)
        }
    }

    async fn command(&self, action: &str, request: Value) -> CliResult<()> {
        let response = self.request(request).await?;
        if self.format == "json" {
            println!("{response}");
            return Ok(());
        }
        let message = response["message"].as_str().unwrap_or_default();
        if response["ok"].as_bool() == Some(true) {
            println!("{} {} {}", "✅".green(), action.bright_white(), message.dimmed());
        } else {
            println!("{} {} failed: {}", "❌".red(), action.bright_white(), message.bright_red());
        }
        Ok(())
    }

    async fn mode_command(&self, target: &str, matches: &ArgMatches<'_>) -> CliResult<()> {
        let mode = matches.value_of("mode").unwrap_or("auto");
        self.command(&format!("{target} mode {mode}"), json!({"cmd": target, "mode": mode}))
            .await
    }

    async fn show_map(&self, title: &str, request: Value) -> CliResult<()> {
        let Some(data) = self.fetch(request).await? else {
            return Ok(());
        };
        if self.format == "json" {
            println!("{}", serde_json::to_string_pretty(&data)?);
            return Ok(());
        }
        println!("{}", title.bright_blue().bold());
        println!("{}", "═".repeat(32).bright_blue());
        if let Some(map) = data.as_object() {
            for (name, value) in map {
                println!("  {:<22} {}", name.bright_white(), value.to_string().bright_cyan());
            }
        }
        Ok(())
    }

    async fn show_status(&self) -> CliResult<()> {
        let Some(data) = self.fetch(json!({"cmd": "status"})).await? else {
            return Ok(());
        };
        if self.format == "json" {
            println!("{}", serde_json::to_string_pretty(&data)?);
            return Ok(());
        }

        let flag = |on: bool| if on { "ON".bright_green() } else { "OFF".dimmed() };
        println!("{}", "📊 Gateway Status".bright_blue().bold());
        println!("{}", "═".repeat(32).bright_blue());
        println!("  {:<22} {}", "time".bright_white(), data["taken_at"].as_str().unwrap_or("-"));
        println!("  {:<22} {} s", "uptime".bright_white(), data["uptime_s"]);
        println!("  {:<22} {}", "relay".bright_white(), flag(data["relay_on"].as_bool().unwrap_or(false)));

        let link = &data["link"];
        let link_state = if link["degraded"].as_bool().unwrap_or(false) {
            "DEGRADED".bright_red()
        } else {
            "OK".bright_green()
        };
        println!("  {:<22} {} ({} ok, {} failed)", "serial link".bright_white(), link_state, link["frames_ok"], link["frames_failed"]);
        println!(
            "  {:<22} {}",
            "mqtt".bright_white(),
            flag(data["transport_connected"].as_bool().unwrap_or(false))
        );

        let boost = &data["boost"];
        println!(
            "  {:<22} {} (ratio {}%, {} min)",
            "boost".bright_white(),
            boost["state"].as_str().unwrap_or("-").bright_cyan(),
            boost["ratio"],
            boost["duration_min"]
        );
        if let Some(plus) = data["relay_plus"].as_object() {
            println!(
                "  {:<22} {} min on today",
                "relay+".bright_white(),
                plus.get("on_minutes").and_then(Value::as_f64).unwrap_or(0.0).round()
            );
        }
        if let Some(mirror) = data["mirror"].as_object() {
            let degraded = mirror.get("degraded").and_then(Value::as_bool).unwrap_or(false);
            println!(
                "  {:<22} {}",
                "remote relay".bright_white(),
                if degraded { "DEGRADED".bright_red() } else { "OK".bright_green() }
            );
        }
        if let Some(daily) = data["daily"].as_object() {
            println!("{}", "  Today".bright_blue());
            for (name, value) in daily {
                println!("    {:<20} {} Wh", name.bright_white(), value);
            }
        }
        println!("  {:<22} {}", "history points".bright_white(), data["history_points"]);
        Ok(())
    }

    async fn show_history(&self, csv: bool) -> CliResult<()> {
        let format = if csv { "csv" } else { "json" };
        let Some(data) = self.fetch(json!({"cmd": "history", "format": format})).await? else {
            return Ok(());
        };
        if csv {
            print!("{}", data.as_str().unwrap_or_default());
            return Ok(());
        }
        if self.format == "json" {
            println!("{}", serde_json::to_string_pretty(&data)?);
            return Ok(());
        }
        println!(
            "{} (every {} min)",
            "📈 Energy History".bright_blue().bold(),
            data["interval_min"]
        );
        println!(
            "  {:<20} {:>12} {:>12} {:>12} {:>12} {:>12}",
            "time", "routed", "import", "export", "impulsion", "relay"
        );
        for point in data["points"].as_array().map(Vec::as_slice).unwrap_or_default() {
            let i = &point["indices"];
            println!(
                "  {:<20} {:>12} {:>12} {:>12} {:>12} {:>12}",
                point["time"].as_str().unwrap_or("-"),
                i["routed"],
                i["import"],
                i["export"],
                i["impulsion"],
                i["relay"]
            );
        }
        Ok(())
    }

    async fn show_events(&self) -> CliResult<()> {
        let Some(data) = self.fetch(json!({"cmd": "events"})).await? else {
            return Ok(());
        };
        if self.format == "json" {
            println!("{data}");
            return Ok(());
        }
        for event in data.as_array().map(Vec::as_slice).unwrap_or_default() {
            println!("  {}", event.as_str().unwrap_or_default());
        }
        Ok(())
    }
}

mod connection;

use anyhow::bail;
use clap::{Parser, Subcommand};
use connection::DaemonConnection;
use media_proto::protocol::{
    Control, ControlData, Outgoing, Request, Response, Role, PROTOCOL_VERSION,
};
use media_proto::record::{AggregateView, MediaReport};
use media_proto::TabId;
use tracing::{debug, warn};

#[derive(Parser, Debug)]
#[command(name = "mediactl")]
#[command(about = "Query and control media playing in browser tabs")]
#[command(version)]
struct Cli {
    /// Address of the media-relayd socket
    #[arg(long, env = "MEDIA_RELAY_ADDR", default_value_t = media_proto::platform::daemon_address())]
    address: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the current selection
    State {
        /// Print the raw JSON view
        #[arg(long)]
        json: bool,
    },
    /// List every tracked tab
    Tabs,
    Ping,
    Play,
    Pause,
    Toggle,
    Next,
    Previous,
    /// Set the volume (0-100)
    Volume { level: f64 },
    /// Jump to an absolute position in seconds
    Seek { seconds: f64 },
    /// Print every state update until interrupted
    Watch,
    /// Report media for a tab, as a page agent would
    Report {
        #[arg(long)]
        tab: TabId,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        artist: Option<String>,
        #[arg(long)]
        playing: bool,
        /// Stay connected and print the commands routed to this tab
        #[arg(long)]
        follow: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let mut conn = DaemonConnection::connect(&cli.address).await?;
    debug!("Connected to {}", cli.address);

    match cli.command {
        Command::State { json } => {
            let response = checked(conn.request(&Request::GetMediaState).await?)?;
            let view = response.data.unwrap_or_default();
            if json {
                println!("{}", serde_json::to_string_pretty(&view)?);
            } else {
                print_view(&view);
            }
        }
        Command::Tabs => {
            let response = checked(conn.request(&Request::ListTabs).await?)?;
            for tab in response.tabs.unwrap_or_default() {
                println!(
                    "{:>6}  {}  {}  {}",
                    tab.tab_id,
                    if tab.is_playing { "▶" } else { "⏸" },
                    tab.title.as_deref().unwrap_or("-"),
                    tab.url.as_deref().unwrap_or("")
                );
            }
        }
        Command::Ping => {
            let response = checked(conn.request(&Request::Ping).await?)?;
            println!("{}", if response.pong { "pong" } else { "ok" });
        }
        Command::Play => control(&mut conn, "play", ControlData::default()).await?,
        Command::Pause => control(&mut conn, "pause", ControlData::default()).await?,
        Command::Toggle => control(&mut conn, "toggle", ControlData::default()).await?,
        Command::Next => control(&mut conn, "next", ControlData::default()).await?,
        Command::Previous => control(&mut conn, "previous", ControlData::default()).await?,
        Command::Volume { level } => {
            let data = ControlData {
                volume: Some(level),
                time: None,
            };
            control(&mut conn, "volume", data).await?
        }
        Command::Seek { seconds } => {
            let data = ControlData {
                volume: None,
                time: Some(seconds),
            };
            control(&mut conn, "seek", data).await?
        }
        Command::Watch => watch(&mut conn).await?,
        Command::Report {
            tab,
            title,
            artist,
            playing,
            follow,
        } => {
            let report = MediaReport {
                has_media: Some(true),
                is_playing: Some(playing),
                title: title.map(Some),
                artist: artist.map(Some),
                can_control: Some(true),
                ..MediaReport::default()
            };
            report_as_source(&mut conn, tab, report, follow).await?
        }
    }

    Ok(())
}

fn checked(response: Response) -> anyhow::Result<Response> {
    if !response.success {
        bail!(
            "daemon refused: {}",
            response.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(response)
}

fn hello(role: Role) -> Request {
    Request::Hello {
        protocol_version: PROTOCOL_VERSION,
        role,
    }
}

async fn control(conn: &mut DaemonConnection, action: &str, data: ControlData) -> anyhow::Result<()> {
    // validate locally so typos never reach the daemon
    Control::parse(action, &data)?;
    let request = Request::ControlMedia {
        action: action.to_string(),
        data,
    };
    checked(conn.request(&request).await?)?;
    Ok(())
}

async fn watch(conn: &mut DaemonConnection) -> anyhow::Result<()> {
    conn.send(&hello(Role::Consumer)).await?;
    while let Some(msg) = conn.receive().await? {
        match msg {
            Outgoing::Response(response) => {
                checked(response)?;
            }
            Outgoing::MediaUpdate { data } => print_view(&data),
            Outgoing::Log { message } => eprintln!("{}", message),
            other => debug!("Ignoring {:?}", other),
        }
    }
    warn!("Daemon closed the connection");
    Ok(())
}

async fn report_as_source(
    conn: &mut DaemonConnection,
    tab: TabId,
    report: MediaReport,
    follow: bool,
) -> anyhow::Result<()> {
    checked(
        conn.request(&hello(Role::Source {
            tab_id: Some(tab),
            url: None,
        }))
        .await?,
    )?;

    let detected = Request::MediaDetected {
        data: report.clone(),
        timestamp: None,
        url: None,
    };
    conn.send(&detected).await?;

    if !follow {
        // wait for the MEDIA_DETECTED ack; the snapshot request can go unanswered
        loop {
            match conn.receive().await? {
                Some(Outgoing::Response(response)) => {
                    checked(response)?;
                    return Ok(());
                }
                Some(_) => continue,
                None => bail!("daemon closed the connection"),
            }
        }
    }

    while let Some(msg) = conn.receive().await? {
        match msg {
            Outgoing::Response(response) => {
                checked(response)?;
            }
            Outgoing::GetCurrentState => {
                conn.send(&Request::CurrentState {
                    data: Some(report.clone()),
                })
                .await?;
            }
            Outgoing::ControlCommand { action, data } => {
                match (data.volume, data.time) {
                    (Some(v), _) => println!("{} {}", action, v),
                    (_, Some(t)) => println!("{} {}", action, t),
                    _ => println!("{}", action),
                }
            }
            other => debug!("Ignoring {:?}", other),
        }
    }
    Ok(())
}

fn print_view(view: &AggregateView) {
    if !view.has_media {
        println!("nothing playing (volume {})", view.volume);
        return;
    }
    let track = view.current_track.as_deref().unwrap_or("unknown track");
    let track = match view.artist.as_deref() {
        Some(artist) => format!("{} - {}", artist, track),
        None => track.to_string(),
    };
    println!(
        "{} {}  [{}]  {}/{}s  vol {}  tab {}",
        if view.is_playing { "▶" } else { "⏸" },
        track,
        view.source.as_deref().unwrap_or("?"),
        view.current_time.round(),
        view.duration.round(),
        view.volume,
        view.tab_id.map(|t| t.to_string()).unwrap_or_default()
    );
}

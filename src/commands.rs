//! Subcommand implementations

use std::path::Path;

use rdbg_core::prelude::*;
use rdbg_core::{save_settings, DebuggerKind, SessionEvent, Settings};
use rdbg_device::{toolchain, HttpPageListFetcher, PageListFetcher, Simctl, TokioProcessRunner};
use rdbg_rpc::RemoteDebugger;

use crate::output::OutputEvent;

async fn connect_native(settings: &Settings) -> Result<RemoteDebugger> {
    if settings.debugger.kind == DebuggerKind::WebKit {
        return Err(Error::config(
            "this command needs a native endpoint; WebKit sessions attach to one page",
        ));
    }
    RemoteDebugger::connect_native(&settings.debugger).await
}

pub async fn apps(settings: &Settings) -> Result<()> {
    let debugger = connect_native(settings).await?;
    let apps = debugger.apps().await;
    debugger.disconnect();

    for app in apps? {
        OutputEvent::app(&app).emit();
    }
    Ok(())
}

pub async fn pages(settings: &Settings, app_id: Option<&str>) -> Result<()> {
    if settings.debugger.kind == DebuggerKind::WebKit {
        let pages = HttpPageListFetcher::new()?
            .fetch_pages(&settings.debugger.host, settings.debugger.port)
            .await?;
        for page in &pages {
            OutputEvent::page(None, page).emit();
        }
        return Ok(());
    }

    let debugger = connect_native(settings).await?;
    let selected = debugger.select_app(app_id).await;
    debugger.disconnect();

    let (app_id, pages) = selected?;
    for page in &pages {
        OutputEvent::page(Some(&app_id), page).emit();
    }
    Ok(())
}

pub async fn eval(
    settings: &Settings,
    app_id: Option<&str>,
    page_id: &str,
    script: &str,
) -> Result<()> {
    let debugger = match settings.debugger.kind {
        DebuggerKind::WebKit => RemoteDebugger::connect_webkit(&settings.debugger, page_id).await?,
        DebuggerKind::Native => {
            let debugger = connect_native(settings).await?;
            debugger.select_app(app_id).await?;
            debugger
        }
    };

    let result = async {
        debugger.select_page(page_id).await?;
        debugger.evaluate(script).await
    }
    .await;
    debugger.disconnect();

    OutputEvent::evaluated(result?).emit();
    Ok(())
}

/// Print page changes of the target application until the session ends.
pub async fn watch(settings: &Settings, app_id: Option<&str>) -> Result<()> {
    let debugger = connect_native(settings).await?;
    let mut events = debugger.subscribe();
    debugger.select_app(app_id).await?;

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let done = event == SessionEvent::Disconnected;
                        OutputEvent::session(event).emit();
                        if done {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Dropped {} session event(s)", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, disconnecting");
                break;
            }
        }
    }

    debugger.disconnect();
    Ok(())
}

/// Persist the settings in effect, flags included.
pub fn init(project: &Path, settings: &Settings) -> Result<()> {
    save_settings(project, settings)?;
    info!("Wrote settings to {}", project.join(".rdbg").display());
    Ok(())
}

pub async fn sim_list(settings: &Settings, sdk: Option<&str>) -> Result<()> {
    let xcrun = toolchain::find_xcrun()?;
    debug!("Using {}", xcrun.display());

    let runner = TokioProcessRunner;
    match toolchain::version(&runner).await {
        Ok(version) => info!("Xcode {}", version),
        Err(e) => warn!("Could not determine Xcode version: {}", e),
    }

    let simctl = Simctl::new(runner, &settings.simctl);
    let devices = match sdk {
        Some(sdk) => simctl.devices_for_sdk(sdk).await?,
        None => simctl.list_devices().await?.into_values().flatten().collect(),
    };
    for device in &devices {
        OutputEvent::simulator(device).emit();
    }
    Ok(())
}

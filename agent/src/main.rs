//! Terminal Remote agent - menu bar application.
//!
//! A macOS menu bar process that bridges local shell sessions to a remote
//! browser through a relay server. This binary integrates the tray icon,
//! the relay WebSocket client, the local IPC server, and the subprocess
//! supervisor.

mod app;
mod config;
mod ipc;
mod relay;
mod shell_table;
mod supervisor;

use app::{AppState, BackgroundCommand, UiEvent};
use image::ImageReader;
use ipc::{IpcEvent, IpcServer};
use muda::{CheckMenuItem, Menu, MenuEvent, MenuItem, PredefinedMenuItem};
use relay::{RelayClient, RelayEvent};
use shell_table::ShellTable;
use smappservice_rs::{AppService, ServiceStatus, ServiceType};
use std::io::Cursor;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;
use tracing::{debug, error, info, warn};
use tray_icon::{TrayIconBuilder, TrayIconEvent};

const ID_COPY_CODE: &str = "copy_code";
const ID_LOGIN_ITEM: &str = "login_item";
const ID_QUIT: &str = "quit";

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    info!("starting terminal-remote-agent");

    let (ui_tx, ui_rx) = mpsc::channel::<UiEvent>();
    let (bg_tx, bg_rx) = mpsc::channel::<BackgroundCommand>();

    let ui_tx_bg = ui_tx.clone();
    let bg_handle = thread::spawn(move || {
        run_background_tasks(ui_tx_bg, bg_rx);
    });

    let icon_bytes = include_bytes!("../resources/icon.png");
    let icon_image = ImageReader::new(Cursor::new(icon_bytes))
        .with_guessed_format()
        .expect("failed to read icon format")
        .decode()
        .expect("failed to decode icon");
    let icon_rgba = icon_image.to_rgba8();
    let (width, height) = icon_rgba.dimensions();
    let icon = tray_icon::Icon::from_rgba(icon_rgba.into_raw(), width, height)
        .expect("failed to create icon");

    debug!("icon loaded: {}x{}", width, height);

    let menu = Menu::new();

    let code_item = MenuItem::new("Code: ------", false, None);
    let status_item = MenuItem::new("Status: Connecting...", false, None);
    let sessions_item = MenuItem::new("Sessions: 0", false, None);
    let copy_code_item = MenuItem::with_id(ID_COPY_CODE, "Copy Session Code", true, None);

    let is_login_enabled = is_login_item_enabled();
    let login_item =
        CheckMenuItem::with_id(ID_LOGIN_ITEM, "Start at Login", true, is_login_enabled, None);

    let quit_item = MenuItem::with_id(ID_QUIT, "Quit", true, None);

    menu.append(&code_item).expect("failed to add code item");
    menu.append(&status_item).expect("failed to add status item");
    menu.append(&sessions_item).expect("failed to add sessions item");
    menu.append(&PredefinedMenuItem::separator()).expect("failed to add separator");
    menu.append(&copy_code_item).expect("failed to add copy item");
    menu.append(&PredefinedMenuItem::separator()).expect("failed to add separator");
    menu.append(&login_item).expect("failed to add login item");
    menu.append(&PredefinedMenuItem::separator()).expect("failed to add separator");
    menu.append(&quit_item).expect("failed to add quit item");

    let mut app_state = AppState::new(code_item, status_item, sessions_item, copy_code_item.clone());

    let _tray_icon = TrayIconBuilder::new()
        .with_menu(Box::new(menu))
        .with_icon(icon)
        .with_icon_as_template(true)
        .with_tooltip("Terminal Remote")
        .build()
        .expect("failed to create tray icon");

    info!("tray icon created successfully");

    let menu_receiver = MenuEvent::receiver();
    let tray_receiver = TrayIconEvent::receiver();
    let mut copy_reset_time: Option<Instant> = None;

    info!("entering main event loop");
    loop {
        if let Ok(event) = menu_receiver.try_recv() {
            match event.id().0.as_str() {
                ID_COPY_CODE => {
                    if let Some(code) = &app_state.session_code {
                        match arboard::Clipboard::new() {
                            Ok(mut clipboard) => {
                                if let Err(e) = clipboard.set_text(code.clone()) {
                                    error!("failed to set clipboard: {e}");
                                } else {
                                    info!("session code copied to clipboard: {code}");
                                    app_state.copy_item.set_text("Copied!");
                                    copy_reset_time = Some(Instant::now() + Duration::from_secs(2));
                                }
                            }
                            Err(e) => error!("failed to access clipboard: {e}"),
                        }
                    } else {
                        warn!("copy requested but no session code available");
                    }
                }
                ID_LOGIN_ITEM => {
                    let current = login_item.is_checked();
                    let new_state = !current;
                    match configure_login_item(new_state) {
                        Ok(()) => {
                            login_item.set_checked(new_state);
                            info!("login item {}", if new_state { "enabled" } else { "disabled" });
                        }
                        Err(e) => {
                            error!("failed to configure login item: {e}");
                            warn!("login item registration may require running from a proper .app bundle");
                        }
                    }
                }
                ID_QUIT => {
                    info!("quit requested, shutting down...");
                    let _ = bg_tx.send(BackgroundCommand::Shutdown);
                    break;
                }
                _ => debug!("unknown menu item clicked: {:?}", event.id()),
            }
        }

        if let Ok(event) = tray_receiver.try_recv() {
            debug!("tray event: {event:?}");
        }

        if let Some(reset_time) = copy_reset_time {
            if Instant::now() >= reset_time {
                app_state.copy_item.set_text("Copy Session Code");
                copy_reset_time = None;
            }
        }

        while let Ok(event) = ui_rx.try_recv() {
            match event {
                UiEvent::RelayConnected => {
                    info!("relay connected");
                    app_state.relay_connected = true;
                    app_state.update_status_display();
                }
                UiEvent::RelayDisconnected => {
                    info!("relay disconnected");
                    app_state.relay_connected = false;
                    app_state.session_code = None;
                    app_state.update_status_display();
                    app_state.update_code_display();
                }
                UiEvent::SessionCode(code) => {
                    info!("received session code: {code}");
                    app_state.session_code = Some(code);
                    app_state.update_code_display();
                }
                UiEvent::BrowserConnected(browser_id) => {
                    info!("browser connected: {browser_id}");
                    app_state.browser_count += 1;
                }
                UiEvent::BrowserDisconnected(browser_id) => {
                    info!("browser disconnected: {browser_id}");
                    app_state.browser_count = app_state.browser_count.saturating_sub(1);
                }
                UiEvent::RelayError(msg) => error!("relay error: {msg}"),
                UiEvent::ShellConnected { session_id, name } => {
                    info!("shell connected: {name} ({session_id})");
                    app_state.shell_count += 1;
                    app_state.update_count_display();
                }
                UiEvent::ShellDisconnected { session_id } => {
                    info!("shell disconnected: {session_id}");
                    app_state.shell_count = app_state.shell_count.saturating_sub(1);
                    app_state.update_count_display();
                }
                UiEvent::ShellCountChanged(count) => {
                    app_state.shell_count = count;
                    app_state.update_count_display();
                }
                UiEvent::IpcError(msg) => error!("IPC error: {msg}"),
            }
        }

        thread::sleep(Duration::from_millis(10));
    }

    info!("waiting for background thread to finish...");
    if let Err(e) = bg_handle.join() {
        error!("background thread panicked: {e:?}");
    }

    info!("application exiting");
}

fn is_login_item_enabled() -> bool {
    let service = AppService::new(ServiceType::MainApp);
    matches!(service.status(), ServiceStatus::Enabled)
}

fn configure_login_item(enable: bool) -> Result<(), Box<dyn std::error::Error>> {
    let service = AppService::new(ServiceType::MainApp);

    if enable {
        service.register()?;
        info!("registered as login item");
        if matches!(service.status(), ServiceStatus::RequiresApproval) {
            info!("login item requires user approval in System Settings > Login Items");
            AppService::open_system_settings_login_items();
        }
    } else {
        service.unregister()?;
        info!("unregistered as login item");
    }

    Ok(())
}

/// Run the relay client, IPC server, and subprocess supervisor on a Tokio
/// runtime until a shutdown command arrives.
fn run_background_tasks(ui_tx: mpsc::Sender<UiEvent>, bg_rx: mpsc::Receiver<BackgroundCommand>) {
    info!("background thread starting");
    let rt = Runtime::new().expect("failed to create Tokio runtime");

    rt.block_on(async {
        let shell_table = ShellTable::new();

        let (relay_event_tx, relay_event_rx) = mpsc::channel::<RelayEvent>();
        let (ipc_event_tx, ipc_event_rx) = mpsc::channel::<IpcEvent>();
        let (relay_frame_tx, relay_frame_rx) = tokio::sync::mpsc::channel(relay::RELAY_QUEUE_CAPACITY);

        let mut relay_client = RelayClient::new(
            config::relay_url(),
            relay_event_tx,
            relay_frame_rx,
            shell_table.clone(),
        );

        let mut ipc = match IpcServer::new(
            config::ipc_path(),
            shell_table.clone(),
            relay_frame_tx,
            ipc_event_tx,
        )
        .await
        {
            Ok(server) => server,
            Err(e) => {
                error!("failed to start IPC server: {e}");
                let _ = ui_tx.send(UiEvent::IpcError(format!("failed to start IPC: {e}")));
                return run_relay_only(relay_client, ui_tx, relay_event_rx, bg_rx).await;
            }
        };

        let (status_tx, _status_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut sup = supervisor::Supervisor::spawn(
            supervisor::DEFAULT_RELAY_COMMAND,
            supervisor::DEFAULT_TUNNEL_COMMAND,
            supervisor::DEFAULT_LOG_PATH,
            status_tx,
        )
        .await
        .ok();

        let relay_handle = tokio::spawn(async move {
            relay_client.run().await;
        });
        let ipc_handle = tokio::spawn(async move {
            ipc.run().await;
        });

        let ui_tx_relay = ui_tx.clone();
        let relay_forward_handle =
            tokio::task::spawn_blocking(move || forward_relay_events(relay_event_rx, ui_tx_relay));
        let ui_tx_ipc = ui_tx.clone();
        let ipc_forward_handle =
            tokio::task::spawn_blocking(move || forward_ipc_events(ipc_event_rx, ui_tx_ipc));

        loop {
            match bg_rx.try_recv() {
                Ok(BackgroundCommand::Shutdown) => {
                    info!("shutdown command received");
                    break;
                }
                Err(mpsc::TryRecvError::Empty) => {}
                Err(mpsc::TryRecvError::Disconnected) => {
                    info!("background command channel disconnected, shutting down");
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        if let Some(sup) = sup.as_mut() {
            sup.shutdown().await;
        }
        relay_handle.abort();
        ipc_handle.abort();
        relay_forward_handle.abort();
        ipc_forward_handle.abort();

        info!("background tasks shut down");
    });

    info!("background thread exiting");
}

/// Fallback path when the IPC socket fails to bind: keep the relay client
/// running so the menu bar still shows connection state.
async fn run_relay_only(
    mut relay_client: RelayClient,
    ui_tx: mpsc::Sender<UiEvent>,
    relay_event_rx: mpsc::Receiver<RelayEvent>,
    bg_rx: mpsc::Receiver<BackgroundCommand>,
) {
    let relay_handle = tokio::spawn(async move {
        relay_client.run().await;
    });

    let ui_tx_relay = ui_tx.clone();
    let relay_forward_handle =
        tokio::task::spawn_blocking(move || forward_relay_events(relay_event_rx, ui_tx_relay));

    loop {
        match bg_rx.try_recv() {
            Ok(BackgroundCommand::Shutdown) => break,
            Err(mpsc::TryRecvError::Disconnected) => break,
            Err(mpsc::TryRecvError::Empty) => {}
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    relay_handle.abort();
    relay_forward_handle.abort();
}

fn forward_relay_events(rx: mpsc::Receiver<RelayEvent>, ui_tx: mpsc::Sender<UiEvent>) {
    debug!("relay event forwarder starting");
    loop {
        match rx.recv() {
            Ok(event) => {
                let ui_event = match event {
                    RelayEvent::StateChanged(relay::ReconnectState::Connected) => UiEvent::RelayConnected,
                    RelayEvent::StateChanged(relay::ReconnectState::Disconnected)
                    | RelayEvent::StateChanged(relay::ReconnectState::Reconnecting) => UiEvent::RelayDisconnected,
                    RelayEvent::StateChanged(_) => continue,
                    RelayEvent::SessionCode { code, .. } => UiEvent::SessionCode(code),
                    RelayEvent::BrowserConnected(id) => UiEvent::BrowserConnected(id),
                    RelayEvent::BrowserDisconnected(id) => UiEvent::BrowserDisconnected(id),
                    RelayEvent::Error(msg) => UiEvent::RelayError(msg),
                };
                if ui_tx.send(ui_event).is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    debug!("relay event forwarder exiting");
}

fn forward_ipc_events(rx: mpsc::Receiver<IpcEvent>, ui_tx: mpsc::Sender<UiEvent>) {
    debug!("IPC event forwarder starting");
    loop {
        match rx.recv() {
            Ok(event) => {
                let ui_event = match event {
                    IpcEvent::SessionConnected { shell_id, name } => {
                        UiEvent::ShellConnected { session_id: shell_id, name }
                    }
                    IpcEvent::SessionDisconnected { shell_id } => {
                        UiEvent::ShellDisconnected { session_id: shell_id }
                    }
                    IpcEvent::SessionCountChanged(count) => UiEvent::ShellCountChanged(count),
                    IpcEvent::Error(msg) => UiEvent::IpcError(msg),
                };
                if ui_tx.send(ui_event).is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    debug!("IPC event forwarder exiting");
}

use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    signaling: Signaling,
    rtc: Rtc,
    audio: Audio,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Signaling {
    ws_url: String,
    client_name: String,
    is_sender: bool,
}

#[derive(Deserialize)]
struct Rtc {
    use_stun: bool,
    stun_server: String,
}

#[derive(Deserialize)]
struct Audio {
    playback_device: String,
    playback_period_size: usize,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // 信令配置
    println!("cargo:rustc-env=WS_URL={}", config.signaling.ws_url);
    println!("cargo:rustc-env=CLIENT_NAME={}", config.signaling.client_name);
    println!("cargo:rustc-env=IS_SENDER={}", config.signaling.is_sender);

    // RTC 配置
    println!("cargo:rustc-env=USE_STUN={}", config.rtc.use_stun);
    println!("cargo:rustc-env=STUN_SERVER={}", config.rtc.stun_server);

    // 音频配置
    println!("cargo:rustc-env=PLAYBACK_DEVICE={}", config.audio.playback_device);
    println!("cargo:rustc-env=PLAYBACK_PERIOD_SIZE={}", config.audio.playback_period_size);
}

#[derive(Debug, Clone)]
pub struct Config {
    // 信令服务器配置
    pub ws_url: String,
    pub client_name: &'static str,
    pub is_sender: bool,

    // RTC 配置
    pub use_stun: bool,
    pub stun_server: &'static str,

    // 播放配置
    pub playback_device: &'static str,
    pub playback_period_size: usize,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            ws_url: env!("WS_URL").to_string(),
            client_name: env!("CLIENT_NAME"),
            is_sender: env!("IS_SENDER").parse()
                .map_err(|_| "Failed to parse IS_SENDER")?,

            use_stun: env!("USE_STUN").parse()
                .map_err(|_| "Failed to parse USE_STUN")?,
            stun_server: env!("STUN_SERVER"),

            playback_device: env!("PLAYBACK_DEVICE"),
            playback_period_size: env!("PLAYBACK_PERIOD_SIZE").parse()
                .map_err(|_| "Failed to parse PLAYBACK_PERIOD_SIZE")?,
        })
    }

    /// Apply runtime overrides (`RECEIVER_WS_URL`, `RECEIVER_USE_STUN`) on top of the
    /// build-time values.
    pub fn with_env_overrides(mut self) -> Result<Self, &'static str> {
        if let Ok(url) = std::env::var("RECEIVER_WS_URL") {
            if !url.trim().is_empty() {
                self.ws_url = url.trim().to_string();
            }
        }
        if let Ok(flag) = std::env::var("RECEIVER_USE_STUN") {
            self.use_stun = flag.trim().parse()
                .map_err(|_| "Failed to parse RECEIVER_USE_STUN")?;
        }
        Ok(self)
    }
}

// GB28181 编码规则与通用工具
// @see GB/T 28181-2016 附录 D 统一编码规则

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::net::SocketAddr;

/// 国标编码长度
pub const GB28181_ID_LENGTH: usize = 20;

/// 是否为合法的 20 位国标编码
pub fn is_valid_id(id: &str) -> bool {
    id.len() == GB28181_ID_LENGTH && id.bytes().all(|b| b.is_ascii_digit())
}

/// 是否为视频通道（第 11-13 位为 131 摄像机或 132 网络摄像机）
pub fn is_video_channel(channel_id: &str) -> bool {
    match channel_id.get(10..13) {
        Some(code) => code == "131" || code == "132",
        None => false,
    }
}

/// 生成 n 位随机数字串
pub fn random_digits(n: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

/// 生成 10 位 SSRC，首位 0 表示实时流，1 表示历史回放/下载
pub fn create_ssrc(is_live: bool) -> String {
    let prefix = if is_live { '0' } else { '1' };
    format!("{}{}", prefix, random_digits(9))
}

/// 根据播放类型返回 SDP 会话名称
pub fn session_name(play_type: u8) -> &'static str {
    match play_type {
        1 => "Playback",
        2 => "Download",
        3 => "Talk",
        _ => "Play",
    }
}

/// 生成随机 tag
pub fn generate_tag(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// 生成 RFC 3261 兼容的 Via branch
pub fn generate_branch() -> String {
    format!("z9hG4bK{}", generate_tag(16))
}

/// 比较两个 "ip:port" 地址的 IP 部分，无法解析时退化为整串比较
pub fn is_same_ip(a: &str, b: &str) -> bool {
    match (a.parse::<SocketAddr>(), b.parse::<SocketAddr>()) {
        (Ok(a), Ok(b)) => a.ip() == b.ip(),
        _ => a == b,
    }
}

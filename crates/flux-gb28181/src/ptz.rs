// GB28181 PTZ 指令编码
// A5 0F 01 | 指令码 | 水平速度 | 垂直速度 | 变倍速度(高4位) | 校验和

use crate::{Gb28181Error, Result};

/// 未知速度档位时使用的默认速度
pub const DEFAULT_SPEED: u8 = 125;

const HEADER: [u8; 3] = [0xA5, 0x0F, 0x01];

fn command_code(name: &str) -> Option<u8> {
    let code = match name {
        "stop" => 0,
        "right" => 1,
        "left" => 2,
        "down" => 4,
        "downright" => 5,
        "downleft" => 6,
        "up" => 8,
        "upright" => 9,
        "upleft" => 10,
        "zoomin" => 16,
        "zoomout" => 32,
        _ => return None,
    };
    Some(code)
}

/// 速度档位 "1"-"10" 映射到 0-255
pub fn ptz_speed(level: &str) -> u8 {
    match level {
        "1" => 25,
        "2" => 50,
        "3" => 75,
        "4" => 100,
        "5" => 125,
        "6" => 150,
        "7" => 175,
        "8" => 200,
        "9" => 225,
        "10" => 255,
        _ => DEFAULT_SPEED,
    }
}

/// 生成 16 位大写十六进制 PTZ 指令
pub fn to_ptz_cmd(name: &str, speed: &str) -> Result<String> {
    let code = command_code(name).ok_or_else(|| Gb28181Error::InvalidCommand(name.to_string()))?;
    let speed = ptz_speed(speed);

    let (horizontal, vertical, zoom) = match name {
        "left" | "right" => (speed, 0, 0),
        "up" | "down" => (0, speed, 0),
        "upleft" | "upright" | "downleft" | "downright" => (speed, speed, 0),
        // 变倍速度只有 4 位，放在高 4 位
        "zoomin" | "zoomout" => (0, 0, speed << 4),
        _ => (0, 0, 0),
    };

    let frame = [HEADER[0], HEADER[1], HEADER[2], code, horizontal, vertical, zoom];
    let checksum = (frame.iter().map(|b| *b as u16).sum::<u16>() % 256) as u8;

    Ok(frame
        .iter()
        .chain(std::iter::once(&checksum))
        .map(|b| format!("{:02X}", b))
        .collect())
}

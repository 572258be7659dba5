// GB28181 点播 SDP
// 平台作为接收端（recvonly），媒体服务器以 TCP 被动方式接收 PS 流

use std::fmt;

use crate::utils::session_name;

/// 点播 SDP Offer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpOffer {
    /// 通道 ID，用于 o= 与 u= 行
    pub channel_id: String,

    /// 媒体服务器接收地址
    pub media_host: String,

    /// 媒体服务器接收端口
    pub media_port: u16,

    /// 0 实时 1 回放 2 下载 3 对讲
    pub play_type: u8,

    pub start_time: i64,
    pub end_time: i64,

    /// 10 位 SSRC，写入 y= 行
    pub ssrc: String,
}

impl fmt::Display for SdpOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v=0\r\n")?;
        write!(f, "o={} 0 0 IN IP4 {}\r\n", self.channel_id, self.media_host)?;
        write!(f, "s={}\r\n", session_name(self.play_type))?;
        write!(f, "u={}:0\r\n", self.channel_id)?;
        write!(f, "c=IN IP4 {}\r\n", self.media_host)?;
        write!(f, "t={} {}\r\n", self.start_time, self.end_time)?;
        write!(f, "m=video {} TCP/RTP/AVP 96\r\n", self.media_port)?;
        write!(f, "a=recvonly\r\n")?;
        write!(f, "a=rtpmap:96 PS/90000\r\n")?;
        write!(f, "a=setup:passive\r\n")?;
        write!(f, "a=connection:new\r\n")?;
        write!(f, "y={}\r\n", self.ssrc)
    }
}

/// 设备应答中的媒体信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdpAnswer {
    pub connection: Option<String>,
    pub port: Option<u16>,
    pub ssrc: Option<String>,
}

impl SdpAnswer {
    /// 宽松解析，只关心 c=、m=video 与 y= 行
    pub fn parse(sdp: &str) -> Self {
        let mut answer = SdpAnswer::default();
        for line in sdp.lines() {
            let line = line.trim();
            if let Some(c) = line.strip_prefix("c=") {
                answer.connection = c.split_whitespace().nth(2).map(str::to_string);
            } else if let Some(m) = line.strip_prefix("m=video ") {
                answer.port = m.split_whitespace().next().and_then(|p| p.parse().ok());
            } else if let Some(y) = line.strip_prefix("y=") {
                answer.ssrc = Some(y.to_string());
            }
        }
        answer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(play_type: u8) -> SdpOffer {
        SdpOffer {
            channel_id: "34020000001310000001".to_string(),
            media_host: "10.0.0.5".to_string(),
            media_port: 30000,
            play_type,
            start_time: 0,
            end_time: 0,
            ssrc: "0123456789".to_string(),
        }
    }

    #[test]
    fn test_live_offer() {
        let sdp = offer(0).to_string();
        let lines: Vec<&str> = sdp.split("\r\n").collect();
        assert_eq!(lines[0], "v=0");
        assert_eq!(lines[1], "o=34020000001310000001 0 0 IN IP4 10.0.0.5");
        assert_eq!(lines[2], "s=Play");
        assert_eq!(lines[3], "u=34020000001310000001:0");
        assert_eq!(lines[4], "c=IN IP4 10.0.0.5");
        assert_eq!(lines[5], "t=0 0");
        assert_eq!(lines[6], "m=video 30000 TCP/RTP/AVP 96");
        assert!(lines.contains(&"a=recvonly"));
        assert!(lines.contains(&"a=rtpmap:96 PS/90000"));
        assert!(lines.contains(&"a=setup:passive"));
        assert!(lines.contains(&"a=connection:new"));
        assert!(lines.contains(&"y=0123456789"));
        assert!(sdp.ends_with("\r\n"));
    }

    #[test]
    fn test_playback_offer() {
        let mut o = offer(1);
        o.start_time = 1700000000;
        o.end_time = 1700003600;
        let sdp = o.to_string();
        assert!(sdp.contains("s=Playback\r\n"));
        assert!(sdp.contains("t=1700000000 1700003600\r\n"));
    }

    #[test]
    fn test_parse_answer() {
        let answer = SdpAnswer::parse(
            "v=0\r\no=34020000001310000001 0 0 IN IP4 192.168.1.64\r\ns=Play\r\nc=IN IP4 192.168.1.64\r\nt=0 0\r\nm=video 15060 TCP/RTP/AVP 96\r\na=sendonly\r\ny=0123456789\r\n",
        );
        assert_eq!(answer.connection.as_deref(), Some("192.168.1.64"));
        assert_eq!(answer.port, Some(15060));
        assert_eq!(answer.ssrc.as_deref(), Some("0123456789"));

        assert_eq!(SdpAnswer::parse(""), SdpAnswer::default());
    }
}

// GB28181 REGISTER Digest 鉴权
// 解析 Authorization 头并按 MD5 摘要算法校验

use rand::RngCore;

/// 解析后的 Digest 鉴权信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthInfo {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub algorithm: String,
    /// 请求方法，空时按 REGISTER 计算
    pub method: String,
}

/// 生成随机 nonce（32 位十六进制）
pub fn generate_nonce() -> String {
    let mut buf = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{:02x}", b)).collect()
}

/// 解析 SIP Authorization 头
///
/// ```text
/// Digest username="34020000001320000001",realm="3402000000",
/// nonce="44010b73623249f6916a6acf7c316b8e",uri="sip:34020000002000000001@3402000000",
/// response="e4ca3fdc5869fa1c544ea7af60014444",algorithm=MD5
/// ```
///
/// 容错解析：无法识别的片段直接跳过，永远不会失败。
pub fn parse_authorization(header: &str) -> AuthInfo {
    let header = header.trim();
    let rest = header.strip_prefix("Digest ").unwrap_or(header);

    let mut info = AuthInfo::default();

    for part in rest.split(',') {
        let part = part.trim();
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();

        match key.trim() {
            "username" => info.username = value,
            "realm" => info.realm = value,
            "nonce" => info.nonce = value,
            "uri" => info.uri = value,
            "response" => info.response = value,
            "algorithm" => info.algorithm = value,
            _ => {}
        }
    }

    info
}

/// 校验 Digest 鉴权
///
/// HA1 = MD5(username:realm:password)，HA2 = MD5(method:uri)，
/// response = MD5(HA1:nonce:HA2)。
pub fn validate_auth(info: Option<&AuthInfo>, password: &str) -> bool {
    let Some(info) = info else {
        return false;
    };

    let method = if info.method.is_empty() {
        "REGISTER"
    } else {
        info.method.as_str()
    };

    let expected = compute_digest_response(
        &info.username,
        &info.realm,
        password,
        method,
        &info.uri,
        &info.nonce,
    );

    info.response == expected
}

/// 计算 Digest 响应（不使用 qop）
pub fn compute_digest_response(
    username: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
) -> String {
    let ha1 = md5_hex(&format!("{}:{}:{}", username, realm, password));
    let ha2 = md5_hex(&format!("{}:{}", method, uri));
    md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2))
}

fn md5_hex(s: &str) -> String {
    format!("{:x}", md5::compute(s))
}

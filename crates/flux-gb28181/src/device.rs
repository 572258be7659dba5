// GB28181 设备管理
// 管理已注册设备及其通道，后台定时检查心跳超时

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::model::{Channel, ChannelStatus, Transport};
use crate::parser::ParserRegistry;
use crate::utils::{is_valid_id, is_video_channel};
use crate::{Gb28181Error, Result};

/// 默认心跳间隔（秒）
pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 60;

/// 默认心跳超时次数
pub const DEFAULT_HEARTBEAT_COUNT: u32 = 3;

/// 默认心跳检查周期
pub const DEFAULT_CHECK_PERIOD: Duration = Duration::from_secs(3);

/// GB28181 设备
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    /// 设备 ID（20位国标编码）
    pub device_id: String,

    /// 信令来源地址 ip:port，离线后清空
    pub source_addr: String,

    /// 传输协议（UDP/TCP）
    pub transport: Transport,

    pub online: bool,

    /// 心跳间隔（秒），0 表示使用默认值
    pub heartbeat_interval: u64,

    /// 心跳超时次数，0 表示使用默认值
    pub heartbeat_count: u32,

    #[serde(skip)]
    pub last_heartbeat: DateTime<Utc>,

    #[serde(skip)]
    pub register_time: DateTime<Utc>,

    // DeviceInfo 查询结果
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub firmware: String,

    /// 通道列表（channel_id -> Channel），包含设备自身
    #[serde(skip)]
    pub channels: HashMap<String, Channel>,
}

impl Device {
    pub fn new(device_id: &str, source_addr: &str, transport: Transport) -> Self {
        let now = Utc::now();
        Self {
            device_id: device_id.to_string(),
            source_addr: source_addr.to_string(),
            transport,
            online: false,
            heartbeat_interval: 0,
            heartbeat_count: 0,
            last_heartbeat: now,
            register_time: now,
            name: String::new(),
            manufacturer: String::new(),
            model: String::new(),
            firmware: String::new(),
            channels: HashMap::new(),
        }
    }

    /// 心跳超时时长 interval × count
    pub fn heartbeat_timeout(&self) -> ChronoDuration {
        let interval = if self.heartbeat_interval == 0 {
            DEFAULT_HEARTBEAT_INTERVAL
        } else {
            self.heartbeat_interval
        };
        let count = if self.heartbeat_count == 0 {
            DEFAULT_HEARTBEAT_COUNT
        } else {
            self.heartbeat_count
        };
        ChronoDuration::seconds((interval * count as u64) as i64)
    }

    pub fn get_channel(&self, channel_id: &str) -> Option<&Channel> {
        self.channels.get(channel_id)
    }
}

/// 设备管理器
///
/// 每个设备的修改都在 DashMap 的分片写锁内完成，心跳检查与消息处理不会看到半更新的设备。
/// 通道归属单独登记在 `owners`，同一通道 ID 只能被一个设备认领。
pub struct DeviceRegistry {
    devices: DashMap<String, Device>,
    /// channel_id -> device_id
    owners: DashMap<String, String>,
    parsers: Arc<ParserRegistry>,
    checker: Mutex<Option<CancellationToken>>,
}

impl DeviceRegistry {
    pub fn new(parsers: Arc<ParserRegistry>) -> Self {
        Self {
            devices: DashMap::new(),
            owners: DashMap::new(),
            parsers,
            checker: Mutex::new(None),
        }
    }

    /// 添加或替换设备，设备自身作为一个在线通道
    pub fn add_device(&self, mut device: Device) {
        let now = Utc::now();
        device.last_heartbeat = now;
        device.register_time = now;
        device.online = true;
        device
            .channels
            .insert(device.device_id.clone(), Channel::for_device(&device.device_id));

        self.release_channels(&device.device_id);
        let device_id = device.device_id.clone();
        device.channels.retain(|channel_id, _| self.claim(channel_id, &device_id));

        tracing::info!(
            target: "gb28181::device",
            device_id = %device.device_id,
            source = %device.source_addr,
            transport = %device.transport,
            "Device added"
        );
        self.devices.insert(device.device_id.clone(), device);
    }

    pub fn remove_device(&self, device_id: &str) -> Option<Device> {
        let removed = self.devices.remove(device_id).map(|(_, d)| d);
        self.release_channels(device_id);
        if removed.is_some() {
            tracing::info!(target: "gb28181::device", device_id = %device_id, "Device removed");
        }
        removed
    }

    pub fn get_device(&self, device_id: &str) -> Option<Device> {
        self.devices.get(device_id).map(|d| d.clone())
    }

    pub fn get_devices(&self) -> Vec<Device> {
        self.devices.iter().map(|d| d.value().clone()).collect()
    }

    /// 同一设备重新注册：更新来源地址与传输方式
    pub fn update_registration(&self, device_id: &str, source_addr: &str, transport: Transport) -> bool {
        match self.devices.get_mut(device_id) {
            Some(mut device) => {
                device.source_addr = source_addr.to_string();
                device.transport = transport;
                device.last_heartbeat = Utc::now();
                device.online = true;
                true
            }
            None => false,
        }
    }

    /// 更新心跳；有通道不在线时整体切换为在线
    pub fn update_heartbeat(&self, device_id: &str) -> bool {
        let Some(mut device) = self.devices.get_mut(device_id) else {
            return false;
        };

        device.last_heartbeat = Utc::now();

        let any_off = device
            .channels
            .values()
            .any(|c| c.status != ChannelStatus::On);
        if any_off {
            for channel in device.channels.values_mut() {
                channel.status = ChannelStatus::On;
            }
            device.online = true;
            tracing::info!(target: "gb28181::device", device_id = %device_id, "Device back online");
        }
        true
    }

    /// 更新心跳配置，非正数忽略
    pub fn update_device_config(&self, device_id: &str, interval: u64, count: u32) {
        if let Some(mut device) = self.devices.get_mut(device_id) {
            if interval > 0 {
                device.heartbeat_interval = interval;
            }
            if count > 0 {
                device.heartbeat_count = count;
            }
            tracing::debug!(
                target: "gb28181::device",
                device_id = %device_id,
                heartbeat_interval = device.heartbeat_interval,
                heartbeat_count = device.heartbeat_count,
                "Device config updated"
            );
        }
    }

    /// 记录 DeviceInfo 查询结果，空字段不覆盖
    pub fn update_device_info(
        &self,
        device_id: &str,
        name: &str,
        manufacturer: &str,
        model: &str,
        firmware: &str,
    ) {
        if let Some(mut entry) = self.devices.get_mut(device_id) {
            let device = entry.value_mut();
            for (field, value) in [
                (&mut device.name, name),
                (&mut device.manufacturer, manufacturer),
                (&mut device.model, model),
                (&mut device.firmware, firmware),
            ] {
                if !value.is_empty() {
                    *field = value.to_string();
                }
            }
        }
    }

    /// 合并目录通道
    ///
    /// 按首个通道的厂商选择解析器，解析结果逐个 upsert，不清除已有通道。
    /// 非法 ID 以及已归属其它设备的通道会被丢弃。
    pub fn update_channels(&self, device_id: &str, channels: Vec<Channel>) -> Result<()> {
        if !self.devices.contains_key(device_id) {
            return Err(Gb28181Error::DeviceNotFound(device_id.to_string()));
        }

        let Some(first) = channels.first() else {
            return Ok(());
        };

        let manufacturer = first.manufacturer.clone();
        let parser = self
            .parsers
            .lookup_or_common(&manufacturer)
            .ok_or_else(|| Gb28181Error::NoParser(manufacturer.clone()))?;

        let parsed = parser
            .parse_channels(channels)
            .map_err(|e| Gb28181Error::ParseChannels(e.to_string()))?;

        let mut accepted = Vec::with_capacity(parsed.len());
        for channel in parsed {
            if !is_valid_id(&channel.channel_id) {
                tracing::warn!(
                    target: "gb28181::device",
                    device_id = %device_id,
                    channel_id = %channel.channel_id,
                    "Dropping channel with invalid ID"
                );
                continue;
            }
            if !self.claim(&channel.channel_id, device_id) {
                continue;
            }
            accepted.push(channel);
        }

        let Some(mut device) = self.devices.get_mut(device_id) else {
            // 认领期间设备被移除
            self.release_channels(device_id);
            return Err(Gb28181Error::DeviceNotFound(device_id.to_string()));
        };

        let count = accepted.len();
        for mut channel in accepted {
            // 保留已分配的 SSRC
            if let Some(old) = device.channels.get(&channel.channel_id) {
                if channel.ssrc.is_empty() {
                    channel.ssrc = old.ssrc.clone();
                }
            }
            device.channels.insert(channel.channel_id.clone(), channel);
        }

        tracing::info!(
            target: "gb28181::device",
            device_id = %device_id,
            manufacturer = %manufacturer,
            updated = count,
            total = device.channels.len(),
            "Channels updated"
        );
        Ok(())
    }

    /// 记录点播分配的 SSRC
    pub fn set_channel_ssrc(&self, channel_id: &str, ssrc: &str) {
        let Some(owner) = self.owner_of(channel_id) else {
            return;
        };
        if let Some(mut device) = self.devices.get_mut(&owner) {
            if let Some(channel) = device.channels.get_mut(channel_id) {
                channel.ssrc = ssrc.to_string();
            }
        }
    }

    fn owner_of(&self, channel_id: &str) -> Option<String> {
        self.owners.get(channel_id).map(|o| o.value().clone())
    }

    /// 认领通道：未被认领或已属于该设备时返回 true
    ///
    /// 查询与登记在同一个 entry 锁内完成。
    fn claim(&self, channel_id: &str, device_id: &str) -> bool {
        match self.owners.entry(channel_id.to_string()) {
            Entry::Occupied(entry) if entry.get() != device_id => {
                tracing::warn!(
                    target: "gb28181::device",
                    device_id = %device_id,
                    channel_id = %channel_id,
                    owner = %entry.get(),
                    "Channel already belongs to another device"
                );
                false
            }
            Entry::Occupied(_) => true,
            Entry::Vacant(entry) => {
                entry.insert(device_id.to_string());
                true
            }
        }
    }

    fn release_channels(&self, device_id: &str) {
        self.owners.retain(|_, owner| owner != device_id);
    }

    /// 指定设备的视频通道
    pub fn get_video_channels(&self, device_id: &str) -> Vec<Channel> {
        match self.devices.get(device_id) {
            Some(device) => device
                .channels
                .values()
                .filter(|c| is_video_channel(&c.channel_id))
                .cloned()
                .collect(),
            None => {
                tracing::debug!(target: "gb28181::device", device_id = %device_id, "Device not found");
                Vec::new()
            }
        }
    }

    /// 所有设备的视频通道
    pub fn get_all_video_channels(&self) -> Vec<Channel> {
        self.devices
            .iter()
            .flat_map(|d| {
                d.channels
                    .values()
                    .filter(|c| is_video_channel(&c.channel_id))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// 按通道反查所属设备
    pub fn get_device_by_channel(&self, channel_id: &str) -> Option<Device> {
        let owner = self.owner_of(channel_id)?;
        self.get_device(&owner)
    }

    /// 检查心跳，返回本次判定离线的设备
    ///
    /// 只有这里会把设备置为离线。
    pub fn check_heartbeats_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut offline = Vec::new();

        for mut device in self.devices.iter_mut() {
            if !device.online {
                continue;
            }
            let timeout = device.heartbeat_timeout();
            if now.signed_duration_since(device.last_heartbeat) <= timeout {
                continue;
            }

            for channel in device.channels.values_mut() {
                channel.status = ChannelStatus::Off;
            }
            device.source_addr.clear();
            device.online = false;

            tracing::warn!(
                target: "gb28181::device",
                device_id = %device.device_id,
                heartbeat_interval = device.heartbeat_interval,
                heartbeat_count = device.heartbeat_count,
                "Device is offline due to heartbeat timeout"
            );
            offline.push(device.device_id.clone());
        }

        offline
    }

    /// 启动心跳检查（重复调用无效果）
    pub fn start_heartbeat_checker(self: &Arc<Self>, period: Duration) {
        let mut guard = self.checker.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return;
        }

        let token = CancellationToken::new();
        *guard = Some(token.clone());

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(registry) = weak.upgrade() else {
                            break;
                        };
                        registry.check_heartbeats_at(Utc::now());
                    }
                }
            }
            tracing::debug!(target: "gb28181::device", "Heartbeat checker stopped");
        });

        tracing::info!(
            target: "gb28181::device",
            period_ms = period.as_millis() as u64,
            "Heartbeat checker started"
        );
    }

    pub fn stop_heartbeat_checker(&self) {
        let mut guard = self.checker.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(token) = guard.take() {
            token.cancel();
        }
    }

    pub fn is_heartbeat_checker_running(&self) -> bool {
        let guard = self.checker.lock().unwrap_or_else(|e| e.into_inner());
        guard.is_some()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(Arc::new(ParserRegistry::with_builtin()))
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        self.stop_heartbeat_checker();
    }
}

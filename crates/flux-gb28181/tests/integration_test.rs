// 出站引擎与入站分发的集成测试


use flux_gb28181::dispatcher::Dispatcher;
use flux_gb28181::model::{play_type, ChannelStatus, InviteRequest};
use flux_gb28181::parser::ParserRegistry;
use flux_gb28181::sip::message::SipMethod;
use flux_gb28181::sip::transport::RequestHandler;
use flux_gb28181::{AuthConfig, Device, DeviceRegistry, Gb28181Error};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::*;

fn live_request() -> InviteRequest {
    InviteRequest {
        device_id: DEVICE.to_string(),
        channel_id: CHANNEL.to_string(),
        media_server_id: 0,
        play_type: play_type::LIVE,
        ..Default::default()
    }
}

/// 等待引擎把 RecordInfo 查询发出去
async fn wait_for_query(device: &ScriptedDevice) {
    for _ in 0..100 {
        if device.count(SipMethod::Message) > 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("record query was not sent");
}

#[tokio::test]
async fn test_invite_reuses_session_and_releases_on_last_bye() {
    let h = harness(Duration::from_secs(1));

    let first = h.engine.invite(&live_request()).await.unwrap();
    assert_eq!(first.ref_count, 1);
    assert_eq!(first.status, ChannelStatus::On);
    assert_eq!(first.media_port, 30000);
    assert_eq!(first.media_host, "10.0.0.5");
    assert_eq!(first.url, format!("webrtc://10.0.0.5/live/{}", first.ssrc));
    assert!(first.ssrc.starts_with('0'));

    // 会话建立后媒体服务处于推流状态
    h.media.publishing.store(true, Ordering::SeqCst);

    let second = h.engine.invite(&live_request()).await.unwrap();
    assert_eq!(second.ref_count, 2);
    assert_eq!(second.ssrc, first.ssrc);

    assert_eq!(h.device.count(SipMethod::Invite), 1);
    assert_eq!(h.device.acks.lock().unwrap().len(), 1);
    assert_eq!(h.media.published.load(Ordering::SeqCst), 1);

    let invite = h.device.last(SipMethod::Invite).unwrap();
    let sdp = invite.body_str();
    assert!(sdp.contains(&format!("o={} 0 0 IN IP4 10.0.0.5", CHANNEL)));
    assert!(sdp.contains("s=Play"));
    assert!(sdp.contains("m=video 30000 TCP/RTP/AVP 96\r\n"));
    assert!(sdp.contains("a=setup:passive"));
    assert!(sdp.contains(&format!("y={}", first.ssrc)));
    assert_eq!(
        invite.header("Subject"),
        Some(format!("{}:{},{}:0", CHANNEL, first.ssrc, SERIAL).as_str())
    );

    // 设备上的通道记录了分配的 SSRC
    let device = h.devices.get_device(DEVICE).unwrap();
    assert_eq!(device.get_channel(CHANNEL).unwrap().ssrc, first.ssrc);

    tokio_test::assert_ok!(h.engine.bye(&first.url).await);
    assert_eq!(h.engine.sessions()[0].ref_count, 1);
    assert_eq!(h.device.count(SipMethod::Bye), 0);
    assert_eq!(h.media.unpublished.load(Ordering::SeqCst), 0);

    h.engine.bye(&first.url).await.unwrap();
    assert!(h.engine.sessions().is_empty());
    assert_eq!(h.device.count(SipMethod::Bye), 1);
    assert_eq!(h.media.unpublished.load(Ordering::SeqCst), 1);

    // BYE 沿用对话的 Call-ID，CSeq 递增
    let bye = h.device.last(SipMethod::Bye).unwrap();
    assert_eq!(bye.call_id(), invite.call_id());
    assert_eq!(bye.header("CSeq"), Some("2 BYE"));

    assert!(matches!(
        h.engine.bye(&first.url).await,
        Err(Gb28181Error::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn test_concurrent_invites_share_one_dialog() {
    let h = harness(Duration::from_secs(1));
    h.media.publishing.store(true, Ordering::SeqCst);

    let req = live_request();
    let (a, b) = tokio::join!(h.engine.invite(&req), h.engine.invite(&req));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.ssrc, b.ssrc);
    assert_eq!(a.ref_count.max(b.ref_count), 2);
    assert_eq!(h.device.count(SipMethod::Invite), 1);
    assert_eq!(h.media.published.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stale_session_is_replaced() {
    let h = harness(Duration::from_secs(1));

    let first = h.engine.invite(&live_request()).await.unwrap();
    // 媒体服务上已经没有这路流
    h.media.publishing.store(false, Ordering::SeqCst);

    let second = h.engine.invite(&live_request()).await.unwrap();
    assert_eq!(second.ref_count, 1);
    assert_eq!(h.device.count(SipMethod::Invite), 2);
    assert_eq!(h.media.published.load(Ordering::SeqCst), 2);
    assert_eq!(h.media.unpublished.load(Ordering::SeqCst), 1);
    assert_eq!(h.engine.sessions().len(), 1);
}

#[tokio::test]
async fn test_rejected_invite_releases_media() {
    let h = harness(Duration::from_secs(1));
    h.device.reply_with(SipMethod::Invite, 486);

    let err = h.engine.invite(&live_request()).await.unwrap_err();
    assert!(matches!(err, Gb28181Error::SipTransaction(_)));
    assert_eq!(h.media.published.load(Ordering::SeqCst), 1);
    assert_eq!(h.media.unpublished.load(Ordering::SeqCst), 1);
    assert!(h.engine.sessions().is_empty());
    assert!(h.device.acks.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_ack_tears_down_dialog() {
    let h = harness(Duration::from_secs(1));
    h.device.fail_ack.store(true, Ordering::SeqCst);

    let err = h.engine.invite(&live_request()).await.unwrap_err();
    assert!(matches!(err, Gb28181Error::SipTransaction(_)));

    let invite = h.device.last(SipMethod::Invite).unwrap();
    let bye = h.device.last(SipMethod::Bye).unwrap();
    assert_eq!(h.device.count(SipMethod::Bye), 1);
    assert_eq!(bye.call_id(), invite.call_id());
    assert_eq!(bye.cseq(), invite.cseq().map(|c| c + 1));
    assert_eq!(bye.uri, format!("sip:{}@192.168.1.100:5060", DEVICE));

    assert_eq!(h.media.unpublished.load(Ordering::SeqCst), 1);
    assert!(h.engine.sessions().is_empty());
}

#[tokio::test]
async fn test_invite_invalid_channel() {
    let h = harness(Duration::from_secs(1));
    let mut req = live_request();
    req.channel_id = "3402".to_string();

    assert!(matches!(
        h.engine.invite(&req).await,
        Err(Gb28181Error::InvalidId(_))
    ));
    assert!(h.device.sent.lock().unwrap().is_empty());
    assert_eq!(h.media.published.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_playback_controls() {
    let h = harness(Duration::from_secs(1));
    let req = InviteRequest {
        play_type: play_type::PLAYBACK,
        start_time: 1_704_067_200,
        end_time: 1_704_070_800,
        ..live_request()
    };
    let session = h.engine.invite(&req).await.unwrap();
    assert!(session.ssrc.starts_with('1'));

    let invite = h.device.last(SipMethod::Invite).unwrap();
    assert!(invite.body_str().contains("s=Playback"));
    assert!(invite.body_str().contains("t=1704067200 1704070800"));

    tokio_test::assert_ok!(h.engine.pause(&session.url).await);
    let info = h.device.last(SipMethod::Info).unwrap();
    assert_eq!(info.header("Content-Type"), Some("Application/MANSRTSP"));
    assert!(info.body_str().starts_with("PAUSE RTSP/1.0\r\nCSeq: 1\r\n"));

    h.engine.resume(&session.url).await.unwrap();
    let info = h.device.last(SipMethod::Info).unwrap();
    assert!(info.body_str().starts_with("PLAY RTSP/1.0\r\nCSeq: 2\r\n"));
    assert!(info.body_str().contains("Range: npt=now"));

    h.engine.speed(&session.url, 2.0).await.unwrap();
    let info = h.device.last(SipMethod::Info).unwrap();
    assert!(info.body_str().contains("CSeq: 3\r\n"));
    assert!(info.body_str().contains("Scale: 2.0"));
    assert_eq!(info.call_id(), invite.call_id());

    let err = tokio_test::assert_err!(h.engine.pause("webrtc://10.0.0.5/live/missing").await);
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_remote_bye_skips_outbound_bye() {
    let h = harness(Duration::from_secs(1));
    let session = h.engine.invite(&live_request()).await.unwrap();
    let call_id = h
        .device
        .last(SipMethod::Invite)
        .unwrap()
        .call_id()
        .unwrap()
        .to_string();

    assert!(h.engine.on_remote_bye(&call_id));
    assert_eq!(h.engine.sessions()[0].status, ChannelStatus::Off);
    assert!(!h.engine.on_remote_bye("unknown-call"));

    h.engine.bye(&session.url).await.unwrap();
    assert_eq!(h.device.count(SipMethod::Bye), 0);
    assert_eq!(h.media.unpublished.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_ptz_control() {
    let h = harness(Duration::from_secs(1));

    h.engine
        .control_ptz(DEVICE, CHANNEL, "right", "5")
        .await
        .unwrap();
    let msg = h.device.last(SipMethod::Message).unwrap();
    let body = msg.body_str();
    assert!(body.contains("<CmdType>DeviceControl</CmdType>"));
    assert!(body.contains(&format!("<DeviceID>{}</DeviceID>", CHANNEL)));
    assert!(body.contains("<PTZCmd>A50F01017D000033</PTZCmd>"));

    assert!(matches!(
        h.engine.control_ptz(DEVICE, CHANNEL, "spin", "80").await,
        Err(Gb28181Error::InvalidCommand(_))
    ));
    assert_eq!(h.device.count(SipMethod::Message), 1);
}

#[tokio::test]
async fn test_record_query_accumulates_batches() {
    let h = harness(Duration::from_secs(5));
    let dispatcher = Dispatcher::new(
        Arc::clone(&h.devices),
        Arc::clone(&h.engine),
        "3402000000",
        AuthConfig::default(),
    );

    let engine = Arc::clone(&h.engine);
    let query = tokio::spawn(async move {
        engine
            .query_record(DEVICE, CHANNEL, 1_704_067_200, 1_704_153_600)
            .await
    });
    wait_for_query(&h.device).await;

    let body = h.device.last(SipMethod::Message).unwrap().body_str();
    assert!(body.contains("<CmdType>RecordInfo</CmdType>"));
    assert!(body.contains("<StartTime>"));

    // 设备分两包返回，共 5 条
    let sink = Arc::new(CaptureSink::default());
    dispatcher
        .handle(device_message(&record_info(5, &["a", "b", "c"]), 1), sink.clone())
        .await;
    dispatcher
        .handle(device_message(&record_info(5, &["d", "e"]), 2), sink.clone())
        .await;
    assert_eq!(sink.statuses(), vec![200, 200]);

    let records = query.await.unwrap().unwrap();
    let names: Vec<_> = records.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b", "c", "d", "e"]);
    assert_eq!(records[0].record_type, "time");

    // 查询结束后通道可以再次查询
    assert!(!h
        .engine
        .deliver_records(CHANNEL, flux_gb28181::RecordBatch::default()));
}

#[tokio::test]
async fn test_record_query_timeout_returns_partial() {
    let h = harness(Duration::from_millis(300));

    let engine = Arc::clone(&h.engine);
    let query = tokio::spawn(async move {
        engine
            .query_record(DEVICE, CHANNEL, 1_704_067_200, 1_704_153_600)
            .await
    });
    wait_for_query(&h.device).await;

    let batch = flux_gb28181::RecordBatch {
        sum_num: 5,
        records: (0..3)
            .map(|i| flux_gb28181::model::Record {
                device_id: CHANNEL.to_string(),
                name: format!("r{}", i),
                ..Default::default()
            })
            .collect(),
    };
    assert!(h.engine.deliver_records(CHANNEL, batch));

    match query.await.unwrap() {
        Err(Gb28181Error::RecordQueryTimeout { channel_id, records }) => {
            assert_eq!(channel_id, CHANNEL);
            assert_eq!(records.len(), 3);
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_record_query_empty_result() {
    let h = harness(Duration::from_secs(5));

    let engine = Arc::clone(&h.engine);
    let query = tokio::spawn(async move {
        engine
            .query_record(DEVICE, CHANNEL, 1_704_067_200, 1_704_153_600)
            .await
    });
    wait_for_query(&h.device).await;

    assert!(h
        .engine
        .deliver_records(CHANNEL, flux_gb28181::RecordBatch::default()));
    assert!(query.await.unwrap().unwrap().is_empty());
}

#[tokio::test]
async fn test_catalog_response_merges_channels() {
    let h = harness(Duration::from_secs(1));
    let dispatcher = Dispatcher::new(
        Arc::clone(&h.devices),
        Arc::clone(&h.engine),
        "3402000000",
        AuthConfig::default(),
    );

    let catalog = format!(
        "<?xml version=\"1.0\" encoding=\"GB2312\"?>\
<Response><CmdType>Catalog</CmdType><SN>7</SN><DeviceID>{DEVICE}</DeviceID><SumNum>1</SumNum>\
<DeviceList Num=\"1\"><Item><DeviceID>34020000001310000002</DeviceID><Name>Gate</Name>\
<Manufacturer>Dahua</Manufacturer><ParentID>{DEVICE}</ParentID><Status>ON</Status></Item></DeviceList></Response>"
    );
    let sink = Arc::new(CaptureSink::default());
    dispatcher.handle(device_message(&catalog, 3), sink.clone()).await;
    assert_eq!(sink.statuses(), vec![200]);

    // 增量合并：原有通道保留
    let device = h.devices.get_device(DEVICE).unwrap();
    assert!(device.get_channel(CHANNEL).is_some());
    assert_eq!(device.get_channel("34020000001310000002").unwrap().name, "Gate");
    // 设备自身 + 两个摄像机通道
    assert_eq!(h.devices.get_video_channels(DEVICE).len(), 3);
}

#[tokio::test]
async fn test_update_channels_without_parser() {
    let devices = DeviceRegistry::new(Arc::new(ParserRegistry::empty()));
    devices.add_device(Device::new(
        DEVICE,
        "192.168.1.100:5060",
        flux_gb28181::model::Transport::Udp,
    ));
    let before = devices.get_device(DEVICE).unwrap().channels.len();

    let mut channel = flux_gb28181::model::Channel::for_device(CHANNEL);
    channel.manufacturer = "Hikvision".to_string();
    let err = devices.update_channels(DEVICE, vec![channel]).unwrap_err();

    assert!(matches!(err, Gb28181Error::NoParser(m) if m == "Hikvision"));
    assert_eq!(devices.get_device(DEVICE).unwrap().channels.len(), before);
    assert!(devices.get_device_by_channel(CHANNEL).is_none());
}

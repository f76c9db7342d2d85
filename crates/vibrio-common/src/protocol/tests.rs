//! Tests for request validation, wire encoding and response decoding.

#[cfg(test)]
mod tests {
    use super::super::*;
    use hyper::body::Bytes;
    use hyper::{Method, StatusCode};
    use serde_json::json;

    fn sample_difficulty() -> DifficultyAttributes {
        DifficultyAttributes {
            mods: ModSet::from([OsuMod::DoubleTime]),
            star_rating: 9.7,
            max_combo: 3220,
            aim_difficulty: 4.5,
            speed_difficulty: 3.25,
            speed_note_count: 1200.5,
            flashlight_difficulty: 0.0,
            slider_factor: 0.99,
            approach_rate: 10.33,
            overall_difficulty: 10.08,
            drain_rate: 6.0,
            hit_circle_count: 1800,
            slider_count: 320,
            spinner_count: 2,
        }
    }

    /// Parts of a multipart body as `(name, filename, content)`, read back with `multer`.
    async fn read_parts(body: &CallBody) -> Vec<(String, Option<String>, Bytes)> {
        let boundary = multer::parse_boundary(&body.content_type).unwrap();
        let bytes = body.bytes.clone();
        let stream =
            futures::stream::once(async move { Ok::<_, std::convert::Infallible>(bytes) });
        let mut multipart = multer::Multipart::new(stream, boundary);

        let mut parts = Vec::new();
        while let Some(field) = multipart.next_field().await.unwrap() {
            let name = field.name().unwrap_or_default().to_string();
            let filename = field.file_name().map(str::to_string);
            parts.push((name, filename, field.bytes().await.unwrap()));
        }
        parts
    }

    fn ok(body: serde_json::Value) -> RawResponse {
        RawResponse::new(StatusCode::OK, serde_json::to_vec(&body).unwrap())
    }

    // ============================================================================
    // Mods
    // ============================================================================

    #[test]
    fn test_mod_set_is_order_insensitive_and_deduplicated() {
        let a = ModSet::from([OsuMod::DoubleTime, OsuMod::Hidden, OsuMod::Hidden]);
        let b = ModSet::from([OsuMod::Hidden, OsuMod::DoubleTime]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
        assert_eq!(a.acronyms(), vec!["HD", "DT"]);
    }

    #[test]
    fn test_mod_acronym_parsing() {
        assert_eq!("hd".parse::<OsuMod>().unwrap(), OsuMod::Hidden);
        assert_eq!("NC".parse::<OsuMod>().unwrap(), OsuMod::Nightcore);
        assert!(matches!("XX".parse::<OsuMod>(), Err(VibrioError::Validation(_))));
        for m in OsuMod::ALL {
            assert_eq!(m.acronym().parse::<OsuMod>().unwrap(), m);
        }
    }

    #[test]
    fn test_incompatible_mods_rejected() {
        let mods = ModSet::from([OsuMod::Easy, OsuMod::HardRock]);
        let err = mods.validate().unwrap_err();
        assert!(matches!(err, VibrioError::Validation(_)));

        assert!(ModSet::from([OsuMod::HalfTime, OsuMod::DoubleTime]).validate().is_err());
        assert!(ModSet::from([OsuMod::Hidden, OsuMod::HardRock, OsuMod::DoubleTime]).validate().is_ok());
    }

    #[test]
    fn test_mod_set_display() {
        assert_eq!(ModSet::new().to_string(), "NM");
        assert_eq!(ModSet::from([OsuMod::DoubleTime, OsuMod::Hidden]).to_string(), "HDDT");
    }

    // ============================================================================
    // Validation
    // ============================================================================

    #[test]
    fn test_validation_rejects_bad_requests() {
        let cases = vec![
            CalculationRequest::by_id(0),
            CalculationRequest::by_content(Bytes::new()),
            CalculationRequest::by_id(1).with_hit_stats(HitStatistics::new(0, 0, 0, 0, 10)),
            CalculationRequest::by_id(1).with_mods([OsuMod::Relax, OsuMod::Autopilot]),
            CalculationRequest::by_id(1)
                .with_replay(Bytes::from_static(b"osr"))
                .with_hit_stats(HitStatistics::new(1, 0, 0, 0, 1)),
            CalculationRequest::by_id(1)
                .with_replay(Bytes::from_static(b"osr"))
                .with_mods([OsuMod::Hidden]),
            CalculationRequest::by_id(1).with_replay(Bytes::new()),
            CalculationRequest::from_difficulty(sample_difficulty()),
            CalculationRequest::from_difficulty(sample_difficulty())
                .with_hit_stats(HitStatistics::new(1, 0, 0, 0, 1))
                .with_mods([OsuMod::Hidden]),
        ];

        for request in cases {
            let err = EngineCodec::encode(&request).unwrap_err();
            assert!(
                matches!(err, VibrioError::Validation(_)),
                "expected validation error for {:?}, got {:?}",
                request,
                err
            );
        }
    }

    #[test]
    fn test_hit_statistics_accuracy() {
        let stats = HitStatistics::new(2019, 104, 0, 3, 3141);
        assert_eq!(stats.judgements(), 2126);
        let acc = stats.accuracy().unwrap();
        assert!((acc - 0.96598).abs() < 1e-4, "accuracy was {}", acc);
        assert!(HitStatistics::default().accuracy().is_none());
    }

    #[test]
    fn test_hit_statistics_from_json() {
        let stats = HitStatistics::from_json(
            r#"{"count_300": 2019, "count_100": 104, "count_50": 0, "count_miss": 3, "combo": 3141}"#,
        )
        .unwrap();
        assert_eq!(stats, HitStatistics::new(2019, 104, 0, 3, 3141));

        for bad in [
            r#"{"count_300": -1, "count_100": 0, "count_50": 0, "count_miss": 0, "combo": 1}"#,
            r#"{"count_300": 1.5, "count_100": 0, "count_50": 0, "count_miss": 0, "combo": 1}"#,
            r#"{"count_300": 1}"#,
        ] {
            let err = HitStatistics::from_json(bad).unwrap_err();
            assert!(matches!(err, VibrioError::Validation(_)), "{:?}", err);
        }
    }

    // ============================================================================
    // Encoding
    // ============================================================================

    #[test]
    fn test_encode_difficulty_by_id() {
        let request = CalculationRequest::by_id(1001682).with_mods([OsuMod::DoubleTime]);
        let call = EngineCodec::encode(&request).unwrap();
        assert_eq!(call.method, Method::GET);
        assert_eq!(call.path, "/api/difficulty/1001682");
        assert_eq!(call.beatmap_id, Some(1001682));
        assert_eq!(call.path_and_query(), "/api/difficulty/1001682?mods=DT");
        assert!(call.body.is_none());
        assert!(call.idempotent);
    }

    #[test]
    fn test_encode_performance_by_id() {
        let request = CalculationRequest::by_id(1001682)
            .with_mods([OsuMod::DoubleTime, OsuMod::Hidden])
            .with_hit_stats(HitStatistics::new(2019, 104, 0, 3, 3141));
        let call = EngineCodec::encode(&request).unwrap();
        assert_eq!(
            call.path_and_query(),
            "/api/performance/1001682?mods=HD&mods=DT&count300=2019&count100=104&count50=0&countmiss=3&combo=3141"
        );
    }

    #[test]
    fn test_encode_performance_by_content_uses_multipart() {
        let request = CalculationRequest::by_content(Bytes::from_static(b"osu file format v14"))
            .with_hit_stats(HitStatistics::new(10, 0, 0, 0, 10));
        let call = EngineCodec::encode(&request).unwrap();
        assert_eq!(call.method, Method::POST);
        assert_eq!(call.path, "/api/performance");
        assert_eq!(call.beatmap_id, None);
        assert_eq!(call.query_value("count300"), Some("10"));

        let body = call.body.unwrap();
        assert!(body.content_type.starts_with("multipart/form-data; boundary="));
        let text = String::from_utf8(body.bytes.to_vec()).unwrap();
        assert!(text.contains("name=\"beatmap\""));
        assert!(text.contains("osu file format v14"));
    }

    #[tokio::test]
    async fn test_multipart_parts_read_back_exactly() {
        let beatmap = Bytes::from_static(
            b"osu file format v14\r\n--\r\n--vibrio-\r\n\r\n[Metadata]\r\nBeatmapID:75\r\n",
        );
        let replay = Bytes::from((0..=255u8).chain(*b"\r\n--\r\n").collect::<Vec<u8>>());
        let request = CalculationRequest::by_content(beatmap.clone()).with_replay(replay.clone());

        let call = EngineCodec::encode(&request).unwrap();
        assert_eq!(call.path, "/api/performance/replay");
        let parts = read_parts(&call.body.unwrap()).await;
        assert_eq!(
            parts,
            vec![
                ("beatmap".to_string(), Some("beatmap.osu".to_string()), beatmap),
                ("replay".to_string(), Some("replay.osr".to_string()), replay),
            ]
        );
    }

    #[tokio::test]
    async fn test_multipart_boundary_never_occurs_in_content() {
        let content = Bytes::from_static(b"a\r\n--vibrio-abc\r\nvibrio-abc-1--\r\nb");
        let body = Multipart::with_token("abc")
            .file("beatmap", "beatmap.osu", content.clone())
            .into_body();

        let boundary = multer::parse_boundary(&body.content_type).unwrap();
        assert_eq!(boundary, "vibrio-abc-2");

        let parts = read_parts(&body).await;
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].2, content);
    }

    #[test]
    fn test_encode_replay_by_id() {
        let request = CalculationRequest::by_id(42).with_replay(Bytes::from_static(b"osr-bytes"));
        let call = EngineCodec::encode(&request).unwrap();
        assert_eq!(call.path, "/api/performance/replay/42");
        assert!(call.query.is_empty());
        let text = String::from_utf8(call.body.unwrap().bytes.to_vec()).unwrap();
        assert!(text.contains("name=\"replay\""));
        assert!(!text.contains("name=\"beatmap\""));
    }

    #[test]
    fn test_encode_performance_from_difficulty() {
        let request = CalculationRequest::from_difficulty(sample_difficulty())
            .with_hit_stats(HitStatistics::new(100, 1, 0, 0, 150));
        let call = EngineCodec::encode(&request).unwrap();
        assert_eq!(call.path, "/api/performance");
        assert_eq!(call.beatmap_id, None);
        assert_eq!(call.query_value("mods"), Some("DT"));
        assert_eq!(call.query_value("starrating"), Some("9.7"));
        assert_eq!(call.query_value("maxcombo"), Some("3220"));
        assert_eq!(call.query_value("combo"), Some("150"));
    }

    #[test]
    fn test_absent_hit_stats_are_omitted() {
        let call = EngineCodec::encode(&CalculationRequest::by_id(7)).unwrap();
        assert!(call.query_value("count300").is_none());
        assert!(call.query_value("combo").is_none());
        assert!(call.query.is_empty());
    }

    // ============================================================================
    // Decoding
    // ============================================================================

    #[test]
    fn test_decode_performance_camel_case() {
        let call = EngineCall::get("/api/performance/1");
        let response = ok(json!({
            "total": 1304.35,
            "aim": 600.1,
            "speed": 500.2,
            "accuracy": 150.3,
            "flashlight": 0.0,
            "effectiveMissCount": 3.0
        }));
        let result = EngineCodec::decode(CalculationKind::Performance, &call, &response).unwrap();
        let perf = result.performance().unwrap();
        assert_eq!(perf.total, 1304.35);
        assert_eq!(perf.effective_miss_count, 3.0);
    }

    #[test]
    fn test_decode_difficulty_round_trips_serialized_attributes() {
        let attributes = sample_difficulty();
        let call = EngineCall::get("/api/difficulty/1");
        let response = ok(serde_json::to_value(&attributes).unwrap());
        let result = EngineCodec::decode(CalculationKind::Difficulty, &call, &response).unwrap();
        assert_eq!(result.into_difficulty().unwrap(), attributes);
    }

    #[test]
    fn test_decode_missing_field_is_protocol_error() {
        let call = EngineCall::get("/api/performance/1");
        let response = ok(json!({"total": 1.0, "aim": 1.0}));
        let err = EngineCodec::decode(CalculationKind::Performance, &call, &response).unwrap_err();
        match err {
            VibrioError::Protocol(msg) => {
                assert!(msg.contains("`speed`"), "message was {}", msg);
                assert!(msg.contains("protocol v1"), "message was {}", msg);
            }
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_wrong_type_and_garbage() {
        let call = EngineCall::get("/api/performance/1");
        let response = ok(json!({
            "total": "lots", "aim": 1.0, "speed": 1.0,
            "accuracy": 1.0, "flashlight": 1.0, "effectiveMissCount": 0.0
        }));
        assert!(matches!(
            EngineCodec::decode(CalculationKind::Performance, &call, &response),
            Err(VibrioError::Protocol(_))
        ));

        let garbage = RawResponse::new(StatusCode::OK, "<html>oops</html>");
        assert!(matches!(
            EngineCodec::decode(CalculationKind::Performance, &call, &garbage),
            Err(VibrioError::Protocol(_))
        ));

        let array = ok(json!([1, 2, 3]));
        assert!(matches!(
            EngineCodec::decode(CalculationKind::Performance, &call, &array),
            Err(VibrioError::Protocol(_))
        ));
    }

    #[test]
    fn test_decode_unknown_mod_is_protocol_error() {
        let mut body = serde_json::to_value(sample_difficulty()).unwrap();
        body["mods"] = json!(["DT", "ZZ"]);
        let call = EngineCall::get("/api/difficulty/1");
        assert!(matches!(
            EngineCodec::decode(CalculationKind::Difficulty, &call, &ok(body)),
            Err(VibrioError::Protocol(_))
        ));
    }

    #[test]
    fn test_status_mapping() {
        let by_id = EngineCall::get("/api/difficulty/99").for_beatmap(99);
        let by_content = EngineCall::post("/api/difficulty");

        let not_found = RawResponse::new(StatusCode::NOT_FOUND, "");
        assert_eq!(
            EngineCodec::check_status(&by_id, &not_found),
            Err(VibrioError::BeatmapNotFound(99))
        );
        assert!(matches!(
            EngineCodec::check_status(&by_content, &not_found),
            Err(VibrioError::Validation(_))
        ));

        let bad_request = RawResponse::new(StatusCode::BAD_REQUEST, "bad mods");
        match EngineCodec::check_status(&by_id, &bad_request) {
            Err(VibrioError::Validation(msg)) => assert!(msg.contains("bad mods")),
            other => panic!("expected validation error, got {:?}", other),
        }

        let server_error = RawResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "");
        assert!(matches!(
            EngineCodec::check_status(&by_id, &server_error),
            Err(VibrioError::Protocol(_))
        ));
    }

    #[test]
    fn test_beatmap_status_decoding() {
        let call = EngineCall::beatmap_status(5);
        assert!(EngineCodec::decode_beatmap_status(&call, &RawResponse::new(StatusCode::OK, "")).unwrap());
        assert!(!EngineCodec::decode_beatmap_status(&call, &RawResponse::new(StatusCode::NOT_FOUND, "")).unwrap());
        assert!(EngineCodec::decode_beatmap_status(
            &call,
            &RawResponse::new(StatusCode::SERVICE_UNAVAILABLE, "")
        )
        .is_err());
    }

    #[test]
    fn test_only_transport_errors_are_retryable() {
        assert!(VibrioError::Transport { attempts: 3, cause: "refused".into() }.is_retryable());
        assert!(!VibrioError::Validation("x".into()).is_retryable());
        assert!(!VibrioError::Protocol("x".into()).is_retryable());
        assert!(!VibrioError::EngineUnavailable("x".into()).is_retryable());
        assert!(!VibrioError::BeatmapNotFound(1).is_retryable());
    }
}

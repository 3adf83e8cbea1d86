mod common;

use common::{advance, config, connected, Recorder};
use pretty_assertions::assert_eq;
use serialflow_core::config::EngineConfigBuilder;
use serialflow_core::error::{InterceptorError, SerialError};
use serialflow_core::interceptor::{Chain, Flow};
use serialflow_core::request::{rules, Request, Response};
use serialflow_core::transport::mock::MockLink;

type RequestFlow = Result<Flow<Request>, InterceptorError>;
type ResponseFlow = Result<Flow<Response>, InterceptorError>;

fn echo_link() -> MockLink {
    let link = MockLink::new();
    link.set_responder(|data: &[u8]| {
        let mut reply = data.to_vec();
        reply[0] |= 0x80;
        Some(reply)
    });
    link
}

/// Bytes written and bytes delivered for one request
async fn exchange(builder: EngineConfigBuilder) -> anyhow::Result<(Vec<Vec<u8>>, Vec<Vec<u8>>)> {
    let link = echo_link();
    let engine = connected(&link, builder).await?;
    let rec = Recorder::new();
    engine.submit(
        Request::new(vec![0x12, 0x34, 0x56])
            .with_rule(rules::byte_at(0, 0x92))
            .with_listener(rec.clone()),
    )?;
    advance(500).await;
    engine.disconnect().await;
    Ok((link.written(), rec.response_data()))
}

#[tokio::test(start_paused = true)]
async fn test_identity_interceptors_are_transparent() -> anyhow::Result<()> {
    let baseline = exchange(config()).await?;
    assert_eq!(baseline.0, vec![vec![0x12, 0x34, 0x56]]);
    assert_eq!(baseline.1, vec![vec![0x92, 0x34, 0x56]]);

    let with_identity = exchange(
        config()
            .add_request_interceptor(|chain: Chain<Request>| -> RequestFlow { Ok(chain.pass()) })
            .add_request_interceptor(|chain: Chain<Request>| -> RequestFlow {
                let value = chain.value().clone();
                Ok(chain.proceed(value))
            })
            .add_response_interceptor(|chain: Chain<Response>| -> ResponseFlow { Ok(chain.pass()) }),
    )
    .await?;
    assert_eq!(with_identity, baseline);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_interceptors_transform_both_directions() -> anyhow::Result<()> {
    // append a checksum on the way out, strip it on the way in
    let builder = config()
        .add_request_interceptor(|mut chain: Chain<Request>| -> RequestFlow {
            let request = chain.value_mut();
            let sum = request.data().iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
            let mut data = request.data().to_vec();
            data.push(sum);
            request.set_data(data);
            Ok(chain.pass())
        })
        .add_response_interceptor(|mut chain: Chain<Response>| -> ResponseFlow {
            let response = chain.value_mut();
            let mut data = response.data().to_vec();
            data.pop();
            response.set_data(data);
            Ok(chain.pass())
        });

    let (written, delivered) = exchange(builder).await?;
    assert_eq!(written, vec![vec![0x12, 0x34, 0x56, 0x9C]]);
    assert_eq!(delivered, vec![vec![0x92, 0x34, 0x56]]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_short_circuit_skips_later_stages() -> anyhow::Result<()> {
    let builder = config()
        .add_request_interceptor(|chain: Chain<Request>| -> RequestFlow {
            let mut request = chain.value().clone();
            request.set_tag(Some("short".to_string()));
            Ok(chain.complete(request))
        })
        .add_request_interceptor(|_: Chain<Request>| -> RequestFlow {
            Err(InterceptorError::new("must not run"))
        });

    let (written, delivered) = exchange(builder).await?;
    assert_eq!(written, vec![vec![0x12, 0x34, 0x56]]);
    assert_eq!(delivered.len(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_request_interceptor_error_fails_submit() -> anyhow::Result<()> {
    let link = echo_link();
    let engine = connected(
        &link,
        config().add_request_interceptor(|_: Chain<Request>| -> RequestFlow {
            Err(InterceptorError::new("payload too long"))
        }),
    )
    .await?;

    let err = engine
        .submit(Request::new(vec![0x01]).with_rule(rules::min_len(1)))
        .unwrap_err();
    assert_eq!(
        err,
        SerialError::Interceptor(InterceptorError::new("payload too long"))
    );
    assert_eq!(engine.queued_len(), 0);

    advance(500).await;
    assert_eq!(link.write_count(), 0);

    engine.disconnect().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_response_interceptor_error_fails_entry() -> anyhow::Result<()> {
    let link = echo_link();
    let engine = connected(
        &link,
        config().add_response_interceptor(|_: Chain<Response>| -> ResponseFlow {
            Err(InterceptorError::new("bad checksum"))
        }),
    )
    .await?;

    let rec = Recorder::new();
    let id = engine.submit(
        Request::new(vec![0x12])
            .with_rule(rules::byte_at(0, 0x92))
            .with_response_count(3)
            .with_listener(rec.clone()),
    )?;
    advance(500).await;

    assert!(rec.responses().is_empty());
    assert_eq!(
        rec.failures(),
        vec![(id, SerialError::Interceptor(InterceptorError::new("bad checksum")))]
    );
    assert_eq!(engine.in_flight_len(), 0);
    assert!(engine.is_connected());

    engine.disconnect().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_request_identity_survives_rebuild() -> anyhow::Result<()> {
    let link = echo_link();
    let rec = Recorder::new();
    let sink = rec.clone();
    let engine = connected(
        &link,
        config().add_request_interceptor(move |chain: Chain<Request>| -> RequestFlow {
            // a brand new request built from the old payload
            let rebuilt = Request::new(chain.value().data().to_vec())
                .with_rule(rules::byte_at(0, 0x92))
                .with_listener(sink.clone());
            Ok(chain.proceed(rebuilt))
        }),
    )
    .await?;

    let id = engine.submit(Request::new(vec![0x12]).with_rule(rules::min_len(1)))?;
    advance(500).await;

    assert_eq!(link.written(), vec![vec![0x12]]);
    let responses = rec.responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].request().map(|r| r.id()), Some(id));

    engine.disconnect().await;
    Ok(())
}

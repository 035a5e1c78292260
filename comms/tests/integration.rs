use comms::{
    Deserialize, Serialize,
    msg::{Command, Msg, Payload},
};
use tokio::io;

/// A message made of raw text, sent entirely as a zero-copy tail.
struct Text<'a>(&'a str);

impl<'a> Serialize<'a> for Text<'_> {
    fn serialize(&'a self, _head: &mut Vec<u8>) -> std::io::Result<Option<&'a [u8]>> {
        Ok(Some(self.0.as_bytes()))
    }
}

impl<'a> Deserialize<'a> for Text<'a> {
    fn deserialize(body: &'a [u8]) -> std::io::Result<Self> {
        std::str::from_utf8(body)
            .map(Text)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[tokio::test]
async fn custom_codecs_travel_in_frames() {
    let (one, two) = io::duplex(128);
    let (rx, tx) = io::split(one);
    let (_, mut tx) = comms::channel(rx, tx);
    let (rx, tx_two) = io::split(two);
    let (mut rx, _) = comms::channel(rx, tx_two);

    tx.send(&Text("rank 1 reporting")).await.unwrap();
    tx.send(&Text("")).await.unwrap();

    let mut buf: Vec<u32> = Vec::new();
    let text: Text = rx.recv_into(&mut buf).await.unwrap();
    assert_eq!(text.0, "rank 1 reporting");

    let text: Text = rx.recv_into(&mut buf).await.unwrap();
    assert_eq!(text.0, "");
}

#[tokio::test]
async fn gradients_cross_a_duplex_stream() {
    let (one, two) = io::duplex(64);
    let (rx, tx) = io::split(one);
    let (_, mut tx) = comms::channel(rx, tx);
    let (rx, tx_two) = io::split(two);
    let (mut rx, _) = comms::channel(rx, tx_two);

    let grad: Vec<f32> = (0..1000).map(|i| i as f32 * 0.25).collect();

    let writer = async {
        tx.send(&Msg::Control(Command::Join {
            rank: 1,
            world_size: 2,
        }))
        .await
        .unwrap();
        tx.send(&Msg::Data(Payload::Gradient(&grad))).await.unwrap();
        tx.send(&Msg::Err("worker failed".into())).await.unwrap();
    };

    let reader = async {
        let mut buf: Vec<u32> = Vec::new();

        let msg: Msg = rx.recv_into(&mut buf).await.unwrap();
        assert_eq!(
            msg,
            Msg::Control(Command::Join {
                rank: 1,
                world_size: 2
            })
        );

        let msg: Msg = rx.recv_into(&mut buf).await.unwrap();
        match msg {
            Msg::Data(Payload::Gradient(got)) => assert_eq!(got, grad.as_slice()),
            other => panic!("unexpected message {other:?}"),
        }

        let msg: Msg = rx.recv_into(&mut buf).await.unwrap();
        assert_eq!(msg, Msg::Err("worker failed".into()));
    };

    tokio::join!(writer, reader);
}

#[tokio::test]
async fn closed_stream_surfaces_as_eof() {
    let (one, two) = io::duplex(16);
    drop(one);

    let (rx, tx_two) = io::split(two);
    let (mut rx, _) = comms::channel(rx, tx_two);

    let mut buf: Vec<u32> = Vec::new();
    let err = rx.recv_into::<Msg, _>(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
}

#[tokio::test]
async fn oversized_frames_are_rejected() {
    let (one, two) = io::duplex(256);
    let (rx, tx) = io::split(one);
    let (_, mut tx) = comms::channel(rx, tx);
    let (rx, tx_two) = io::split(two);
    let (rx, _) = comms::channel(rx, tx_two);
    let mut rx = rx.with_max_frame_len(16);

    let params = [0f32; 8];
    tx.send(&Msg::Data(Payload::Params(&params))).await.unwrap();
    assert_eq!(tx.frames_sent(), 1);

    let mut buf: Vec<u32> = Vec::new();
    let err = rx.recv_into::<Msg, _>(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
}

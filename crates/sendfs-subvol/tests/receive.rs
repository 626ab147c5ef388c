//! End-to-end runs: raw stream bytes through the parser, the subvolume
//! set, freezing, and rendering.

use std::io::Cursor;

use sendfs_error::ApplyError;
use sendfs_subvol::{ReceiveError, SubvolumeSet};
use sendfs_types::{SEND_STREAM_MAGIC, SEND_STREAM_VERSION};
use sendfs_wire::SendStream;
use uuid::Uuid;

const KIND_SUBVOL: u16 = 1;
const KIND_SNAPSHOT: u16 = 2;
const KIND_MKFILE: u16 = 3;
const KIND_MKDIR: u16 = 4;
const KIND_LINK: u16 = 10;
const KIND_UNLINK: u16 = 11;
const KIND_WRITE: u16 = 15;
const KIND_CLONE: u16 = 16;
const KIND_TRUNCATE: u16 = 17;
const KIND_CHMOD: u16 = 18;
const KIND_CHOWN: u16 = 19;
const KIND_UTIMES: u16 = 20;
const KIND_END: u16 = 21;

const ATTR_UUID: u16 = 1;
const ATTR_CTRANSID: u16 = 2;
const ATTR_SIZE: u16 = 4;
const ATTR_MODE: u16 = 5;
const ATTR_UID: u16 = 6;
const ATTR_GID: u16 = 7;
const ATTR_CTIME: u16 = 9;
const ATTR_MTIME: u16 = 10;
const ATTR_ATIME: u16 = 11;
const ATTR_PATH: u16 = 15;
const ATTR_PATH_TO: u16 = 16;
const ATTR_PATH_LINK: u16 = 17;
const ATTR_FILE_OFFSET: u16 = 18;
const ATTR_DATA: u16 = 19;
const ATTR_CLONE_UUID: u16 = 20;
const ATTR_CLONE_CTRANSID: u16 = 21;
const ATTR_CLONE_PATH: u16 = 22;
const ATTR_CLONE_OFFSET: u16 = 23;
const ATTR_CLONE_LEN: u16 = 24;

struct Command {
    kind: u16,
    payload: Vec<u8>,
}

impl Command {
    fn new(kind: u16) -> Self {
        Command {
            kind,
            payload: Vec::new(),
        }
    }

    fn attr(mut self, kind: u16, data: &[u8]) -> Self {
        self.payload.extend_from_slice(&kind.to_le_bytes());
        self.payload
            .extend_from_slice(&(u16::try_from(data.len()).expect("fits u16")).to_le_bytes());
        self.payload.extend_from_slice(data);
        self
    }

    fn attr_u64(self, kind: u16, value: u64) -> Self {
        self.attr(kind, &value.to_le_bytes())
    }

    fn attr_time(self, kind: u16, sec: u64) -> Self {
        let mut data = sec.to_le_bytes().to_vec();
        data.extend_from_slice(&0_u32.to_le_bytes());
        self.attr(kind, &data)
    }

    fn build(self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(
            &(u32::try_from(self.payload.len()).expect("fits u32")).to_le_bytes(),
        );
        out.extend_from_slice(&self.kind.to_le_bytes());
        out.extend_from_slice(&0_u32.to_le_bytes()); // crc, unchecked
        out.extend_from_slice(&self.payload);
        out
    }
}

fn stream(commands: Vec<Vec<u8>>) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(SEND_STREAM_MAGIC);
    out.extend_from_slice(&SEND_STREAM_VERSION.to_le_bytes());
    for cmd in commands {
        out.extend_from_slice(&cmd);
    }
    out.extend_from_slice(&Command::new(KIND_END).build());
    out
}

fn subvol(name: &[u8], uuid: Uuid, transid: u64) -> Vec<u8> {
    Command::new(KIND_SUBVOL)
        .attr(ATTR_PATH, name)
        .attr(ATTR_UUID, uuid.as_bytes())
        .attr_u64(ATTR_CTRANSID, transid)
        .build()
}

fn snapshot(name: &[u8], uuid: Uuid, transid: u64, parent: Uuid, parent_transid: u64) -> Vec<u8> {
    Command::new(KIND_SNAPSHOT)
        .attr(ATTR_PATH, name)
        .attr(ATTR_UUID, uuid.as_bytes())
        .attr_u64(ATTR_CTRANSID, transid)
        .attr(ATTR_CLONE_UUID, parent.as_bytes())
        .attr_u64(ATTR_CLONE_CTRANSID, parent_transid)
        .build()
}

fn mkfile(path: &[u8]) -> Vec<u8> {
    Command::new(KIND_MKFILE).attr(ATTR_PATH, path).build()
}

fn mkdir(path: &[u8]) -> Vec<u8> {
    Command::new(KIND_MKDIR).attr(ATTR_PATH, path).build()
}

fn write(path: &[u8], offset: u64, len: usize) -> Vec<u8> {
    Command::new(KIND_WRITE)
        .attr(ATTR_PATH, path)
        .attr_u64(ATTR_FILE_OFFSET, offset)
        .attr(ATTR_DATA, &vec![0xab; len])
        .build()
}

/// chmod + chown + utimes in one go; every inode needs all three before
/// the volume passes `check_complete`.
fn metadata(path: &[u8], mode: u64, uid: u64, gid: u64, sec: u64, atime_sec: u64) -> Vec<Vec<u8>> {
    vec![
        Command::new(KIND_CHMOD)
            .attr(ATTR_PATH, path)
            .attr_u64(ATTR_MODE, mode)
            .build(),
        Command::new(KIND_CHOWN)
            .attr(ATTR_PATH, path)
            .attr_u64(ATTR_UID, uid)
            .attr_u64(ATTR_GID, gid)
            .build(),
        Command::new(KIND_UTIMES)
            .attr(ATTR_PATH, path)
            .attr_time(ATTR_CTIME, sec)
            .attr_time(ATTR_MTIME, sec)
            .attr_time(ATTR_ATIME, atime_sec)
            .build(),
    ]
}

fn receive(set: &mut SubvolumeSet, bytes: &[u8]) -> Result<(), ReceiveError> {
    set.receive(SendStream::new(Cursor::new(bytes)).expect("stream header"))
}

#[test]
fn one_stream_builds_a_complete_rendered_volume() {
    let mut commands = vec![
        subvol(b"vol", Uuid::from_bytes([1; 16]), 1),
        mkdir(b"d"),
        mkfile(b"d/f"),
        write(b"d/f", 0, 5),
        Command::new(KIND_TRUNCATE)
            .attr(ATTR_PATH, b"d/f")
            .attr_u64(ATTR_SIZE, 4)
            .build(),
    ];
    commands.extend(metadata(b"", 0o755, 0, 0, 100, 100));
    commands.extend(metadata(b"d", 0o755, 0, 0, 100, 100));
    commands.extend(metadata(b"d/f", 0o644, 1, 2, 100, 102));

    let mut set = SubvolumeSet::new();
    receive(&mut set, &stream(commands)).expect("receive");
    let frozen = set.freeze().expect("freeze");
    frozen.check_complete().expect("all metadata was sent");

    let rendered = frozen.render().expect("render");
    let vol = rendered.get("vol").expect("one subvolume");
    assert_eq!(
        vol.to_string(),
        concat!(
            r#"["(Dir m755 o0:0 t100+0+0)",{"d":["(Dir m755 o0:0 t100+0+0)","#,
            r#"{"f":["(File m644 o1:2 t100+0+2 d4)"]}]}]"#,
        ),
    );
}

#[test]
fn hardlinks_round_trip_through_the_wire_format() {
    let commands = vec![
        subvol(b"vol", Uuid::from_bytes([1; 16]), 1),
        mkfile(b"a"),
        write(b"a", 0, 3),
        Command::new(KIND_LINK)
            .attr(ATTR_PATH, b"b")
            .attr(ATTR_PATH_LINK, b"a")
            .build(),
        Command::new(KIND_LINK)
            .attr(ATTR_PATH, b"c")
            .attr(ATTR_PATH_LINK, b"b")
            .build(),
        Command::new(KIND_UNLINK).attr(ATTR_PATH, b"a").build(),
    ];
    let mut set = SubvolumeSet::new();
    receive(&mut set, &stream(commands)).expect("receive");
    let frozen = set.freeze().expect("freeze");
    let rendered = frozen.render().expect("render");
    assert_eq!(
        rendered.get("vol").expect("vol").to_string(),
        r#"["(Dir)",{"b":[["(File d3)",0]],"c":[["(File d3)",0]]}]"#,
    );
}

#[test]
fn clone_reaches_across_subvolumes() {
    let src_uuid = Uuid::from_bytes([1; 16]);
    let mut set = SubvolumeSet::new();
    receive(
        &mut set,
        &stream(vec![
            subvol(b"vol", src_uuid, 1),
            mkfile(b"f"),
            write(b"f", 0, 8),
        ]),
    )
    .expect("first stream");
    receive(
        &mut set,
        &stream(vec![
            subvol(b"other", Uuid::from_bytes([2; 16]), 2),
            mkfile(b"g"),
            Command::new(KIND_CLONE)
                .attr(ATTR_PATH, b"g")
                .attr_u64(ATTR_FILE_OFFSET, 0)
                .attr_u64(ATTR_CLONE_LEN, 4)
                .attr(ATTR_CLONE_UUID, src_uuid.as_bytes())
                .attr_u64(ATTR_CLONE_CTRANSID, 1)
                .attr(ATTR_CLONE_PATH, b"f")
                .attr_u64(ATTR_CLONE_OFFSET, 2)
                .build(),
        ]),
    )
    .expect("second stream");

    let frozen = set.freeze().expect("freeze");
    let rendered = frozen.render().expect("render");
    assert_eq!(
        rendered.get("vol").expect("vol").to_string(),
        r#"["(Dir)",{"f":["(File d8(other@g:0+4@2))"]}]"#,
    );
    assert_eq!(
        rendered.get("other").expect("other").to_string(),
        r#"["(Dir)",{"g":["(File d4(vol@f:2+4@0))"]}]"#,
    );
}

#[test]
fn snapshot_then_divergence() {
    let parent_uuid = Uuid::from_bytes([1; 16]);
    let snap_uuid = Uuid::from_bytes([2; 16]);
    let mut set = SubvolumeSet::new();
    receive(
        &mut set,
        &stream(vec![
            subvol(b"vol", parent_uuid, 1),
            mkfile(b"f"),
            write(b"f", 0, 8),
        ]),
    )
    .expect("first stream");
    receive(
        &mut set,
        &stream(vec![
            snapshot(b"snap", snap_uuid, 2, parent_uuid, 1),
            Command::new(KIND_TRUNCATE)
                .attr(ATTR_PATH, b"f")
                .attr_u64(ATTR_SIZE, 6)
                .build(),
        ]),
    )
    .expect("snapshot stream");

    let frozen = set.freeze().expect("freeze");
    let rendered = frozen.render().expect("render");
    // The snapshot's first 6 bytes still share storage with the parent.
    assert_eq!(
        rendered.get("vol").expect("vol").to_string(),
        r#"["(Dir)",{"f":["(File d8(snap@f:0+6@0))"]}]"#,
    );
    assert_eq!(
        rendered.get("snap").expect("snap").to_string(),
        r#"["(Dir)",{"f":["(File d6(vol@f:0+6@0))"]}]"#,
    );
}

#[test]
fn same_name_subvolumes_render_under_distinct_keys() {
    let mut set = SubvolumeSet::new();
    receive(&mut set, &stream(vec![subvol(b"vol", Uuid::from_bytes([1; 16]), 1)]))
        .expect("first stream");
    receive(&mut set, &stream(vec![subvol(b"vol", Uuid::from_bytes([2; 16]), 2)]))
        .expect("second stream");
    let frozen = set.freeze().expect("freeze");
    let rendered = frozen.render().expect("render");
    let keys: Vec<&str> = rendered.keys().map(String::as_str).collect();
    assert_eq!(keys, ["vol@01", "vol@02"]);
}

#[test]
fn stream_must_open_with_a_subvolume() {
    let mut set = SubvolumeSet::new();
    let err = receive(&mut set, &stream(vec![mkfile(b"f")])).unwrap_err();
    assert!(matches!(
        err,
        ReceiveError::Apply(ApplyError::StreamWithoutSubvolume { .. })
    ));
}

#[test]
fn apply_errors_surface_with_the_failing_item() {
    let commands = vec![
        subvol(b"vol", Uuid::from_bytes([1; 16]), 1),
        Command::new(KIND_UNLINK).attr(ATTR_PATH, b"missing").build(),
    ];
    let mut set = SubvolumeSet::new();
    let err = receive(&mut set, &stream(commands)).unwrap_err();
    match err {
        ReceiveError::Apply(ApplyError::NotFound { path, .. }) => {
            assert_eq!(path, "missing");
        }
        other => panic!("unexpected error: {other}"),
    }
}

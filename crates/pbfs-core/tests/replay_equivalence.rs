//! Random operation sequences: the leader's view after a sequence must
//! equal a fresh mount's view after journal replay, for any mix of
//! create/write/truncate/unlink/mkdir/rename.

use pbfs_core::{mkfs, Environment, MountOptions, OpenFlags};
use pbfs_dev::RamDevice;
use pbfs_types::{Geometry, HostId};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Deterministic xorshift64*; tests must not depend on ambient entropy.
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.next() % bound
    }
}

/// Recursively capture (path → contents-or-dir-marker).
fn snapshot(env: &Environment, dir: &str, out: &mut BTreeMap<String, Vec<u8>>) {
    let handle = env.opendir(dir).expect("opendir");
    let mut entries = Vec::new();
    while let Some(entry) = env.readdir(handle).expect("readdir") {
        entries.push(entry);
    }
    env.closedir(handle).expect("closedir");

    for entry in entries {
        let path = format!("{}/{}", dir.trim_end_matches('/'), entry.name);
        if entry.is_dir {
            out.insert(path.clone(), b"<dir>".to_vec());
            snapshot(env, &path, out);
        } else {
            let stat = env.stat(&path).expect("stat");
            let fd = env.open(&path, OpenFlags::read_only()).expect("open");
            let mut contents = vec![0_u8; stat.size as usize];
            let n = env.pread(fd, &mut contents, 0).expect("read");
            assert_eq!(n as u64, stat.size);
            env.close(fd).expect("close");
            out.insert(path.clone(), contents);
        }
    }
}

#[test]
fn random_sequences_replay_identically() {
    for seed in [3_u64, 17, 4242] {
        let run = tempfile::tempdir().expect("run dir");
        let geo = Geometry::new(512, 512, 4096, 64 * 4096).expect("geometry");
        let dev = Arc::new(RamDevice::new(32 * 1024 * 1024, 512));
        mkfs(run.path(), "pbd0", dev.as_ref(), geo, 1024 * 1024).expect("mkfs");

        let env = Environment::new(run.path());
        env.mount(
            "pbd0",
            Arc::clone(&dev) as Arc<dyn pbfs_dev::DevIo>,
            MountOptions {
                host_id: HostId(1),
                read_write: true,
                ..MountOptions::default()
            },
        )
        .expect("mount");

        let mut rng = Rng(seed);
        let mut files: Vec<String> = Vec::new();
        let mut dirs: Vec<String> = vec!["/pbd0".to_owned()];

        for step in 0..120 {
            match rng.below(6) {
                // create + write
                0 | 1 => {
                    let dir = &dirs[rng.below(dirs.len() as u64) as usize];
                    let path = format!("{dir}/f{step}");
                    let fd = env
                        .open(
                            &path,
                            OpenFlags {
                                create: true,
                                ..OpenFlags::read_write()
                            },
                        )
                        .expect("create");
                    let len = rng.below(3 * 4096) as usize;
                    let byte = (rng.next() % 251) as u8;
                    env.write(fd, &vec![byte; len]).expect("write");
                    env.close(fd).expect("close");
                    files.push(path);
                }
                // truncate an existing file
                2 => {
                    if files.is_empty() {
                        continue;
                    }
                    let path = &files[rng.below(files.len() as u64) as usize];
                    env.truncate(path, rng.below(4 * 4096)).expect("truncate");
                }
                // unlink
                3 => {
                    if files.is_empty() {
                        continue;
                    }
                    let idx = rng.below(files.len() as u64) as usize;
                    let path = files.swap_remove(idx);
                    env.unlink(&path).expect("unlink");
                }
                // mkdir
                4 => {
                    let dir = dirs[rng.below(dirs.len() as u64) as usize].clone();
                    let path = format!("{dir}/d{step}");
                    env.mkdir(&path).expect("mkdir");
                    dirs.push(path);
                }
                // rename a file into a (possibly different) directory
                _ => {
                    if files.is_empty() {
                        continue;
                    }
                    let idx = rng.below(files.len() as u64) as usize;
                    let src = files[idx].clone();
                    let dir = &dirs[rng.below(dirs.len() as u64) as usize];
                    let dst = format!("{dir}/r{step}");
                    env.rename(&src, &dst, false).expect("rename");
                    files[idx] = dst;
                }
            }
        }

        let mut before = BTreeMap::new();
        snapshot(&env, "/pbd0", &mut before);

        // Crash without umount: only mkfs's checkpoint plus the journal
        // survive.
        drop(env);

        let env = Environment::new(run.path());
        env.mount(
            "pbd0",
            dev,
            MountOptions {
                host_id: HostId(1),
                read_write: true,
                ..MountOptions::default()
            },
        )
        .expect("replay mount");

        let mut after = BTreeMap::new();
        snapshot(&env, "/pbd0", &mut after);
        assert_eq!(before, after, "seed {seed}: replay diverged");
    }
}

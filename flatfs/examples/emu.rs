use flatfs::io::{FileDisk, FileDiskBuilder};
use flatfs::Volume;

pub fn main() {
    let tmp = tempfile::tempfile().unwrap();
    let dev = FileDiskBuilder::from(tmp)
        .build()
        .expect("Could not initialize disk emulator.");

    let mut fs = Volume::format(dev).expect("should format");
    fs.create("note").unwrap();
    let slot = fs.open("note").unwrap();
    fs.write(slot, b"hello from a flat file system").unwrap();
    fs.close(slot).unwrap();

    // Remount from the same file to show everything landed on disk.
    let file = fs.unmount().unwrap().into_file();
    let fs = Volume::mount(FileDisk::open(file).unwrap()).expect("should mount");
    for (name, length) in fs.list() {
        println!("{:>4} {:>4} bytes", name, length);
    }
    println!("{} blocks free", fs.free_block_count());
}

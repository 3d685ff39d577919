fn main() {
    offsync_lib::run()
}

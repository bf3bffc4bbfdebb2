fn main() {
    broadcast_lib::run()
}

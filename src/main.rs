fn main() {
    ag2api::run();
}

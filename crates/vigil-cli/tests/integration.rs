use vigil_cli::input::Input;
use vigil_cli::runner::Runner;
use vigil_core::pipeline::RunStatus;

#[test]
fn integration() -> anyhow::Result<()> {
    let output = std::env::temp_dir().join(format!("vigil-cli-{}", std::process::id()));

    let mut input = Input::load("../../tests/data/params.json")?;
    input.fasta = Some("../../tests/data/vigil.fasta".into());
    input.identifications = Some("../../tests/data/identifications.json".into());
    input.output_directory = Some(output.display().to_string());

    let runner = Runner::new(input.build()?)?;
    let result = runner.run(2)?;
    assert_eq!(result.status, RunStatus::Complete);
    assert!(result.psm_summary.unwrap().validated > 0);

    for file in ["psms.tsv", "peptides.tsv", "proteins.tsv", "results.json"] {
        assert!(output.join(file).exists(), "{} was not written", file);
    }

    let psms = std::fs::read_to_string(output.join("psms.tsv"))?;
    assert!(psms.starts_with("psm\tfilename\tcharge"));
    // header plus one line per spectrum
    assert_eq!(psms.lines().count(), 321);

    let peptides = std::fs::read_to_string(output.join("peptides.tsv"))?;
    let phospho = peptides
        .lines()
        .find(|line| line.starts_with("GASPTLK[Phospho]\t"))
        .expect("phosphopeptide row");
    assert!(phospho.contains("Phospho@3:"));

    let proteins = std::fs::read_to_string(output.join("proteins.tsv"))?;
    assert!(proteins.contains("sp|Q8N3Y7|KSUB_HUMAN"));
    assert!(proteins.contains("sp|P04264|K2C1_HUMAN/sp|P35908|K22E_HUMAN"));

    let report: serde_json::Value =
        serde_json::from_slice(&std::fs::read(output.join("results.json"))?)?;
    assert_eq!(report["result"]["status"]["status"], "complete");
    assert_eq!(report["settings"]["output_paths"].as_array().map(Vec::len), Some(4));

    std::fs::remove_dir_all(&output)?;
    Ok(())
}
